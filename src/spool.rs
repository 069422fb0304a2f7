use crate::error::BackendError;
use crate::types::RowIdentity;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const SPOOL_EXTENSION: &str = "json";
pub const ERROR_SUFFIX: &str = ".error";

#[async_trait]
pub trait SpoolFlusher: Send + Sync {
    // `Err(BackendError::Malformed)` quarantines the file; any other error keeps
    // it for the next pass.
    async fn flush(&self, filename: &str, contents: &[u8]) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushed: usize,
    pub quarantined: usize,
    pub retained: usize,
}

fn sanitize(row_id: &str) -> String {
    row_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

pub async fn write_to_spool<T>(dir: &Path, category: &str, record: &T) -> Result<PathBuf, BackendError>
where
    T: Serialize + RowIdentity,
{
    let category_dir = dir.join(category);
    tokio::fs::create_dir_all(&category_dir).await?;

    let bytes = serde_json::to_vec(record)?;
    let filename = format!(
        "{}_{}.{SPOOL_EXTENSION}",
        Utc::now().timestamp_millis(),
        sanitize(&record.row_id())
    );
    let path = category_dir.join(filename);
    let partial = path.with_extension("partial");

    // renamed into place so a scan never sees half a record
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, &path).await?;
    Ok(path)
}

pub struct Spool {
    dir: PathBuf,
    flushers: BTreeMap<String, Arc<dyn SpoolFlusher>>,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            flushers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, category: &str, flusher: Arc<dyn SpoolFlusher>) {
        self.flushers.insert(category.to_string(), flusher);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn pending(&self, category: &str) -> Vec<PathBuf> {
        let suffix = format!(".{SPOOL_EXTENSION}");
        list_files(&self.dir.join(category), |name| name.ends_with(&suffix)).await
    }

    pub async fn quarantined(&self, category: &str) -> Vec<PathBuf> {
        list_files(&self.dir.join(category), |name| name.ends_with(ERROR_SUFFIX)).await
    }

    pub async fn flush_once(&self) -> FlushStats {
        let mut stats = FlushStats::default();
        for (category, flusher) in &self.flushers {
            for path in self.pending(category).await {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let contents = match tokio::fs::read(&path).await {
                    Ok(contents) => contents,
                    Err(err) => {
                        warn!("cannot read spool file {}: {err}", path.display());
                        stats.retained += 1;
                        continue;
                    }
                };

                match flusher.flush(&filename, &contents).await {
                    Ok(()) => {
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            warn!("cannot remove flushed spool file {}: {err}", path.display());
                        }
                        debug!("flushed {category}/{filename}");
                        stats.flushed += 1;
                    }
                    Err(BackendError::Malformed(reason)) => {
                        error!("quarantining spool file {category}/{filename}: {reason}");
                        let mut quarantined = path.clone().into_os_string();
                        quarantined.push(ERROR_SUFFIX);
                        if let Err(err) = tokio::fs::rename(&path, &quarantined).await {
                            error!("cannot quarantine {}: {err}", path.display());
                        }
                        stats.quarantined += 1;
                    }
                    Err(err) => {
                        warn!("replay of {category}/{filename} failed, will retry: {err}");
                        stats.retained += 1;
                    }
                }
            }
        }
        stats
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            let stats = self.flush_once().await;
            if stats != FlushStats::default() {
                info!(
                    flushed = stats.flushed,
                    quarantined = stats.quarantined,
                    retained = stats.retained,
                    "spool flush pass"
                );
            }
            sleep(interval).await;
        }
    }
}

async fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("cannot list spool directory {}: {err}", dir.display());
                break;
            }
        };
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        let path = entry.path();
        if is_file && path.file_name().and_then(|n| n.to_str()).is_some_and(&keep) {
            files.push(path);
        }
    }
    files.sort();
    files
}
