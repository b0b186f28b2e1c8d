//! Persistent Cache Store and its single writer.
//!
//! Every save goes through one [`PersistWriter`] task, so two writes never
//! interleave on disk. Saves that pile up while a write is running collapse
//! into one write of the newest document.

use crate::error::PersistenceError;
use harbor_engine::PersistedState;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Where the persisted document lives.
#[async_trait::async_trait]
pub trait PersistentStore: Send + Sync {
    /// The last saved document, or `None` on first start.
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError>;

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;
}

/// One JSON file, replaced atomically through a sibling temp file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl PersistentStore for FileStore {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(Some(PersistedState::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        let json = state.to_json()?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// Keeps the document in memory, as serialized JSON.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Option<String>>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every save fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last saved document.
    pub fn contents(&self) -> Option<PersistedState> {
        let document = self.document.lock().clone()?;
        PersistedState::from_json(&document).ok()
    }
}

#[async_trait::async_trait]
impl PersistentStore for MemoryStore {
    async fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let document = self.document.lock().clone();
        match document {
            Some(json) => Ok(Some(PersistedState::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        let json = state.to_json()?;
        *self.document.lock() = Some(json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Ack = oneshot::Sender<Result<(), PersistenceError>>;

struct SaveRequest {
    state: PersistedState,
    ack: Option<Ack>,
}

/// The single writer in front of a [`PersistentStore`].
pub struct PersistWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<SaveRequest>>>,
    degraded: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistWriter {
    pub fn spawn(store: Arc<dyn PersistentStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(write_loop(store, rx, Arc::clone(&degraded)));
        Self {
            tx: Mutex::new(Some(tx)),
            degraded,
            task: Mutex::new(Some(task)),
        }
    }

    fn send(&self, request: SaveRequest) -> Result<(), PersistenceError> {
        let tx = self.tx.lock().clone().ok_or(PersistenceError::WriterStopped)?;
        tx.send(request).map_err(|_| PersistenceError::WriterStopped)
    }

    /// Save and wait until the document is written.
    pub async fn save(&self, state: PersistedState) -> Result<(), PersistenceError> {
        let (ack, done) = oneshot::channel();
        self.send(SaveRequest {
            state,
            ack: Some(ack),
        })?;
        done.await.map_err(|_| PersistenceError::WriterStopped)?
    }

    /// Save without waiting.
    pub fn save_detached(&self, state: PersistedState) {
        if self.send(SaveRequest { state, ack: None }).is_err() {
            tracing::warn!("Persist writer stopped; dropping save");
        }
    }

    /// Whether the last save failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Finish pending writes and stop the task. Later saves fail.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Persist writer panicked: {}", e);
            }
        }
    }
}

async fn write_loop(
    store: Arc<dyn PersistentStore>,
    mut rx: mpsc::UnboundedReceiver<SaveRequest>,
    degraded: Arc<AtomicBool>,
) {
    while let Some(first) = rx.recv().await {
        let mut state = first.state;
        let mut acks: Vec<Ack> = first.ack.into_iter().collect();
        while let Ok(next) = rx.try_recv() {
            state = next.state;
            acks.extend(next.ack);
        }

        match store.save(&state).await {
            Ok(()) => {
                if degraded.swap(false, Ordering::SeqCst) {
                    tracing::info!("Persistence recovered");
                }
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                degraded.store(true, Ordering::SeqCst);
                tracing::warn!(
                    error = %e,
                    "Save failed; continuing in memory with degraded durability"
                );
                let message = e.to_string();
                for ack in acks {
                    let _ = ack.send(Err(PersistenceError::Write(message.clone())));
                }
            }
        }
    }
}
