use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-job log files under `<data_dir>/logs/<job id>.log`.
///
/// Files are opened when an agent accepts a job and closed when it finishes.
/// Lines for a job without an open file are appended by reopening it.
#[derive(Debug)]
pub struct JobLogs {
    dir: PathBuf,
    open: Mutex<HashMap<Uuid, File>>,
}

impl JobLogs {
    pub async fn new(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = data_dir.as_ref().join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    async fn open_file(&self, id: &Uuid) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(id))
            .await
    }

    pub async fn open(&self, id: &Uuid) -> std::io::Result<()> {
        let file = self.open_file(id).await?;
        self.open.lock().await.insert(*id, file);
        Ok(())
    }

    /// Append `line` plus a newline.
    pub async fn append(&self, id: &Uuid, line: &str) -> std::io::Result<()> {
        let mut open = self.open.lock().await;
        let file = match open.entry(*id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.open_file(id).await?),
        };
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }

    pub async fn close(&self, id: &Uuid) -> std::io::Result<()> {
        if let Some(mut file) = self.open.lock().await.remove(id) {
            file.flush().await?;
        }
        Ok(())
    }

    /// Whole log of a job. A job that never logged anything reads as empty.
    pub async fn read(&self, id: &Uuid) -> std::io::Result<String> {
        match tokio::fs::read_to_string(self.path(id)).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}
