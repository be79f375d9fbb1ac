use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ClassConfig;
use crate::error::SinkError;
use crate::types::ProtocolClass;

/// Destination for verified addresses, one result set per protocol class.
///
/// `record` may be called concurrently for the same class; implementations
/// serialize the writes so each address lands as one complete line.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Drop whatever a previous run left for `class`. Missing output is not an error.
    async fn reset(&self, class: ProtocolClass) -> Result<(), SinkError>;

    async fn record(&self, class: ProtocolClass, address: &str) -> Result<(), SinkError>;

    /// Flush and release the destination once the batch for `class` is done.
    async fn finalize(&self, class: ProtocolClass) -> Result<(), SinkError>;
}

struct Slot {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

/// Appends verified addresses to one plaintext file per protocol class.
///
/// Each file has a single lazily-opened handle behind its own lock, so
/// classes never contend with each other and appends within a class never
/// interleave.
pub struct FileSink {
    slots: HashMap<ProtocolClass, Slot>,
}

impl FileSink {
    pub fn new<I, P>(outputs: I) -> Self
    where
        I: IntoIterator<Item = (ProtocolClass, P)>,
        P: Into<PathBuf>,
    {
        let slots = outputs
            .into_iter()
            .map(|(class, path)| {
                (
                    class,
                    Slot {
                        path: path.into(),
                        file: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    pub fn from_classes(classes: &[ClassConfig]) -> Self {
        Self::new(classes.iter().map(|c| (c.class, c.output.clone())))
    }

    pub fn path(&self, class: ProtocolClass) -> Option<&Path> {
        self.slots.get(&class).map(|s| s.path.as_path())
    }

    fn slot(&self, class: ProtocolClass) -> Result<&Slot, SinkError> {
        self.slots.get(&class).ok_or(SinkError::NoDestination(class))
    }
}

async fn open_append(path: &Path) -> Result<File, SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn check_address(address: &str) -> Result<&str, std::io::Error> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.contains(['\n', '\r']) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("refusing malformed address {address:?}"),
        ));
    }
    Ok(trimmed)
}

#[async_trait]
impl ResultSink for FileSink {
    async fn reset(&self, class: ProtocolClass) -> Result<(), SinkError> {
        let slot = self.slot(class)?;
        let mut guard = slot.file.lock().await;
        guard.take();
        match fs::remove_file(&slot.path).await {
            Ok(()) => {
                info!(%class, path = %slot.path.display(), "removed previous results");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SinkError::Remove {
                path: slot.path.clone(),
                source,
            }),
        }
    }

    async fn record(&self, class: ProtocolClass, address: &str) -> Result<(), SinkError> {
        let slot = self.slot(class)?;
        let address = check_address(address).map_err(|source| SinkError::Write {
            path: slot.path.clone(),
            source,
        })?;
        let line = format!("{address}\n");

        let mut guard = slot.file.lock().await;
        if guard.is_none() {
            *guard = Some(open_append(&slot.path).await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(SinkError::NoDestination(class));
        };
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            // Reopen on the next record rather than reuse a handle in an unknown state.
            guard.take();
            return Err(SinkError::Write {
                path: slot.path.clone(),
                source,
            });
        }
        Ok(())
    }

    async fn finalize(&self, class: ProtocolClass) -> Result<(), SinkError> {
        let slot = self.slot(class)?;
        let mut guard = slot.file.lock().await;
        if let Some(mut file) = guard.take() {
            let done = match file.flush().await {
                Ok(()) => file.sync_all().await,
                Err(e) => Err(e),
            };
            done.map_err(|source| SinkError::Write {
                path: slot.path.clone(),
                source,
            })?;
        }
        debug!(%class, path = %slot.path.display(), "results finalized");
        Ok(())
    }
}

/// Keeps result sets in memory; useful for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    sets: Mutex<HashMap<ProtocolClass, Vec<String>>>,
    finalized: Mutex<HashSet<ProtocolClass>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lines(&self, class: ProtocolClass) -> Vec<String> {
        self.sets.lock().await.get(&class).cloned().unwrap_or_default()
    }

    pub async fn is_finalized(&self, class: ProtocolClass) -> bool {
        self.finalized.lock().await.contains(&class)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn reset(&self, class: ProtocolClass) -> Result<(), SinkError> {
        self.sets.lock().await.remove(&class);
        self.finalized.lock().await.remove(&class);
        Ok(())
    }

    async fn record(&self, class: ProtocolClass, address: &str) -> Result<(), SinkError> {
        let address = check_address(address).map_err(|source| SinkError::Write {
            path: PathBuf::from(format!("memory://{class}")),
            source,
        })?;
        self.sets
            .lock()
            .await
            .entry(class)
            .or_default()
            .push(address.to_string());
        Ok(())
    }

    async fn finalize(&self, class: ProtocolClass) -> Result<(), SinkError> {
        self.finalized.lock().await.insert(class);
        Ok(())
    }
}
