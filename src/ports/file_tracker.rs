use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Fields, PortError, PortResult, TaskTracker};

const RECORD_EXTENSION: &str = "json";

/// Tracker storing one JSON file per record.
///
/// Stands in for a hosted tracker when driving the engine locally. Writes go
/// through a temp file and a rename so a reader never sees half a record.
#[derive(Debug)]
pub struct FileTracker {
    root_dir: PathBuf,
    id_pattern: Regex,
    write_lock: Mutex<()>,
}

impl FileTracker {
    /// Create a tracker storing records under `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> PortResult<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir).map_err(|err| io_error(&root_dir, err))?;
        let id_pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]*$")
            .map_err(|err| PortError::InvalidInput(err.to_string()))?;
        Ok(Self {
            root_dir,
            id_pattern,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn record_path(&self, id: &str) -> PortResult<PathBuf> {
        if !self.id_pattern.is_match(id) || id.contains("..") {
            return Err(PortError::InvalidInput(format!("invalid record id '{}'", id)));
        }
        Ok(self
            .root_dir
            .join(format!("{}.{}", id.replace(':', "_"), RECORD_EXTENSION)))
    }

    async fn read(&self, path: &Path) -> PortResult<Option<Fields>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(fields)) => Ok(Some(fields)),
                Ok(_) => Err(PortError::InvalidInput(format!(
                    "record {} is not a JSON object",
                    path.display()
                ))),
                Err(err) => Err(PortError::InvalidInput(format!(
                    "record {} is not valid JSON: {}",
                    path.display(),
                    err
                ))),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    async fn write(&self, path: &Path, fields: &Fields) -> PortResult<()> {
        let json = serde_json::to_string_pretty(fields)
            .map_err(|err| PortError::InvalidInput(err.to_string()))?;
        let temp_path = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|err| io_error(&temp_path, err))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|err| io_error(&temp_path, err))?;
        file.sync_all().await.map_err(|err| io_error(&temp_path, err))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|err| io_error(path, err))?;
        Ok(())
    }

    async fn next_id(&self) -> PortResult<String> {
        let mut count = 0usize;
        let mut entries = tokio::fs::read_dir(&self.root_dir)
            .await
            .map_err(|err| io_error(&self.root_dir, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| io_error(&self.root_dir, err))?
        {
            if entry.path().extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION) {
                count += 1;
            }
        }
        Ok(format!("REC-{}", count + 1))
    }
}

fn io_error(path: &Path, err: io::Error) -> PortError {
    PortError::Unavailable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl TaskTracker for FileTracker {
    async fn create_record(&self, mut fields: Fields) -> PortResult<String> {
        let _guard = self.write_lock.lock().await;
        let id = self.next_id().await?;
        let path = self.record_path(&id)?;
        fields.insert("id".to_string(), Value::String(id.clone()));
        fields
            .entry("created_at".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        self.write(&path, &fields).await?;
        debug!(record_id = %id, "Created tracker record");
        Ok(id)
    }

    async fn update_record(&self, id: &str, fields: Fields) -> PortResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(id)?;
        let mut record = self
            .read(&path)
            .await?
            .ok_or_else(|| PortError::NotFound(format!("record '{}'", id)))?;
        record.extend(fields);
        record.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.write(&path, &record).await?;
        debug!(record_id = %id, "Updated tracker record");
        Ok(())
    }

    async fn query_record(&self, id: &str) -> PortResult<Option<Fields>> {
        let path = self.record_path(id)?;
        self.read(&path).await
    }
}
