//! Durable upload queue.
//!
//! Each queued upload is an index file in the queue directory holding one
//! form field per line, `name,value`. The `file` field names the payload to
//! send with it. Index files are written under a temporary name and renamed
//! to `<name>.upload` once complete, so an uploader never sees a partial one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use log::{debug, error, info};

use crate::error::QueueError;

pub const QUEUE_DIR: &str = "queue";
pub const INDEX_EXTENSION: &str = "upload";

/// Ordered form fields of an upload.
pub type UploadDescriptor = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpload {
    pub index_path: PathBuf,
    pub fields: UploadDescriptor,
}

impl QueuedUpload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Payload file, if the index names one.
    pub fn file(&self) -> Option<&Path> {
        self.field("file").map(Path::new)
    }
}

pub struct UploadQueue {
    dir: PathBuf,
    notify: Option<Sender<PathBuf>>,
}

fn parse_index(contents: &str) -> UploadDescriptor {
    contents
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(',')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

impl UploadQueue {
    /// Opens the queue, creating its directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<UploadQueue, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| QueueError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(UploadQueue { dir, notify: None })
    }

    /// Sends the index path of every new upload to `tx`.
    pub fn with_notifier(mut self, tx: Sender<PathBuf>) -> UploadQueue {
        self.notify = Some(tx);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues `descriptor` under `<id>-index.upload`.
    ///
    /// On failure nothing is left behind: the partial index and the payload
    /// named by its `file` field are removed.
    pub fn enqueue(&self, id: &str, descriptor: &[(String, String)]) -> Result<PathBuf, QueueError> {
        let index_path = self.dir.join(format!("{}-index", id));
        let upload_path = self.dir.join(format!("{}-index.{}", id, INDEX_EXTENSION));

        let written = write_index(&index_path, descriptor)
            .and_then(|_| fs::rename(&index_path, &upload_path));
        if let Err(source) = written {
            error!("error writing upload index file '{}'", index_path.display());
            let _ = fs::remove_file(&index_path);
            if let Some((_, file)) = descriptor.iter().find(|(k, _)| k == "file") {
                if fs::remove_file(file).is_err() {
                    error!("error removing temporary file '{}'", file);
                }
            }
            return Err(QueueError::WriteIndex {
                path: index_path.display().to_string(),
                source,
            });
        }

        info!("queued upload {}", upload_path.display());
        self.tickle(&upload_path);
        Ok(upload_path)
    }

    fn tickle(&self, upload_path: &Path) {
        if let Some(tx) = &self.notify {
            if tx.send(upload_path.to_path_buf()).is_err() {
                debug!("upload notifier is gone");
            }
        }
    }

    /// Queued uploads, oldest name first.
    pub fn pending(&self) -> Result<Vec<QueuedUpload>, QueueError> {
        let suffix = format!(".{}", INDEX_EXTENSION);
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(&suffix))
            .collect();
        paths.sort();
        paths
            .into_iter()
            .map(|index_path| -> Result<QueuedUpload, QueueError> {
                let fields = parse_index(&fs::read_to_string(&index_path)?);
                Ok(QueuedUpload { index_path, fields })
            })
            .collect()
    }

    /// Drops an upload after it was sent: its index and its payload.
    pub fn remove(&self, upload: &QueuedUpload) -> Result<(), QueueError> {
        fs::remove_file(&upload.index_path)?;
        if let Some(file) = upload.file() {
            if file.exists() {
                fs::remove_file(file)?;
            }
        }
        Ok(())
    }

    /// First `HHMMSS`-style id at or after `base` with no payload or index
    /// in the queue.
    pub fn free_id(&self, base: u32, payload_suffix: &str) -> String {
        let mut id = base;
        loop {
            let candidate = format!("{:06}", id);
            let taken = self.dir.join(format!("{}{}", candidate, payload_suffix)).exists()
                || self.dir.join(format!("{}-index", candidate)).exists()
                || self
                    .dir
                    .join(format!("{}-index.{}", candidate, INDEX_EXTENSION))
                    .exists();
            if !taken {
                return candidate;
            }
            id += 1;
        }
    }
}

fn write_index(path: &Path, descriptor: &[(String, String)]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    for (name, value) in descriptor {
        writeln!(file, "{},{}", name, value)?;
    }
    file.sync_all()
}
