//! Transfer Observer
//!
//! Caller-side handle on one transfer. Reads come from the record store;
//! the event bus only tells the observer when to look again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use super::db::TransferDb;
use super::error::TransferError;
use super::events::{TransferEvent, TransferEvents};
use super::state::TransferState;
use super::types::{TransferId, TransferRecord, TransferType};

/// Re-read interval while waiting, covers missed events and deletes
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Callbacks for one observed transfer
///
/// Called from a background task; implementations must not block.
pub trait TransferListener: Send + Sync {
    fn on_state_changed(&self, id: TransferId, state: TransferState);

    fn on_progress_changed(&self, id: TransferId, bytes_current: u64, bytes_total: u64);

    fn on_error(&self, _id: TransferId, _message: &str) {}
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: TransferState,
    bytes_current: u64,
    bytes_total: u64,
    error: Option<String>,
}

impl Snapshot {
    fn from_record(record: &TransferRecord) -> Self {
        Self {
            state: record.state,
            bytes_current: record.bytes_current,
            bytes_total: record.bytes_total,
            error: record.error.clone(),
        }
    }

    fn apply(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::StateChanged { state, .. } => self.state = *state,
            TransferEvent::ProgressChanged {
                bytes_current,
                bytes_total,
                ..
            } => {
                self.bytes_current = *bytes_current;
                self.bytes_total = *bytes_total;
            }
            TransferEvent::Error { message, .. } => self.error = Some(message.clone()),
        }
    }
}

/// Live view of one transfer record
pub struct TransferObserver {
    id: TransferId,
    transfer_type: TransferType,
    bucket: String,
    key: String,
    file_path: PathBuf,
    db: TransferDb,
    events: TransferEvents,
    snapshot: Arc<Mutex<Snapshot>>,
    listener_task: Option<JoinHandle<()>>,
}

impl TransferObserver {
    /// Bind to an existing record
    pub async fn bind(
        db: TransferDb,
        events: TransferEvents,
        id: TransferId,
    ) -> Result<Self, TransferError> {
        let record = db
            .get(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))?;
        Ok(Self::from_record(db, events, &record))
    }

    pub(crate) fn from_record(db: TransferDb, events: TransferEvents, record: &TransferRecord) -> Self {
        Self {
            id: record.id,
            transfer_type: record.transfer_type,
            bucket: record.bucket.clone(),
            key: record.key.clone(),
            file_path: record.file_path.clone(),
            db,
            events,
            snapshot: Arc::new(Mutex::new(Snapshot::from_record(record))),
            listener_task: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// State as of the last refresh or event
    pub fn state(&self) -> TransferState {
        self.read(|s| s.state)
    }

    pub fn bytes_current(&self) -> u64 {
        self.read(|s| s.bytes_current)
    }

    pub fn bytes_total(&self) -> u64 {
        self.read(|s| s.bytes_total)
    }

    /// Last failure message, if any
    pub fn error(&self) -> Option<String> {
        self.read(|s| s.error.clone())
    }

    /// Reload the snapshot from the record store
    pub async fn refresh(&self) -> Result<TransferState, TransferError> {
        let record = self
            .db
            .get(self.id)
            .await?
            .ok_or(TransferError::TransferNotFound(self.id))?;
        let snapshot = Snapshot::from_record(&record);
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = snapshot;
        }
        Ok(record.state)
    }

    /// Register a listener, replacing any previous one
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_listener(&mut self, listener: Arc<dyn TransferListener>) {
        self.clean_listener();

        let id = self.id;
        let db = self.db.clone();
        let snapshot = self.snapshot.clone();
        let mut rx = self.events.subscribe();

        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.id() == id => {
                        if let Ok(mut guard) = snapshot.lock() {
                            guard.apply(&event);
                        }
                        notify(listener.as_ref(), &event);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(transfer_id = id, skipped, "Listener lagged, re-reading record");
                        if let Ok(Some(record)) = db.get(id).await {
                            if let Ok(mut guard) = snapshot.lock() {
                                *guard = Snapshot::from_record(&record);
                            }
                            // the skipped events may have carried the failure
                            if record.state == TransferState::Failed
                                && let Some(message) = record.error.as_deref()
                            {
                                listener.on_error(id, message);
                            }
                            listener.on_state_changed(id, record.state);
                            listener.on_progress_changed(
                                id,
                                record.bytes_current,
                                record.bytes_total,
                            );
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Detach the current listener
    pub fn clean_listener(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener_task.is_some()
    }

    /// Wait until the observed state satisfies `predicate`
    ///
    /// Subscribes before reading the store so a transition between the read
    /// and the subscription is never missed. Returns `TransferNotFound` if
    /// the record is deleted while waiting.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<TransferState, TransferError>
    where
        F: FnMut(TransferState) -> bool,
    {
        let mut rx = self.events.subscribe();
        let state = self.refresh().await?;
        if predicate(state) {
            return Ok(state);
        }

        loop {
            match tokio::time::timeout(WAIT_POLL_INTERVAL, rx.recv()).await {
                Ok(Ok(TransferEvent::StateChanged { id, state })) if id == self.id => {
                    if let Ok(mut guard) = self.snapshot.lock() {
                        guard.state = state;
                    }
                    if predicate(state) {
                        return Ok(state);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(_))) | Err(_) => {
                    let state = self.refresh().await?;
                    if predicate(state) {
                        return Ok(state);
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    let state = self.refresh().await?;
                    return if predicate(state) {
                        Ok(state)
                    } else {
                        Err(TransferError::ServiceUnavailable(
                            "event bus closed".to_string(),
                        ))
                    };
                }
            }
        }
    }

    /// Wait for `state`
    pub async fn wait_for(&self, state: TransferState) -> Result<TransferState, TransferError> {
        self.wait_until(|s| s == state).await
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        match self.snapshot.lock() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl Drop for TransferObserver {
    fn drop(&mut self) {
        self.clean_listener();
    }
}

impl std::fmt::Debug for TransferObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferObserver")
            .field("id", &self.id)
            .field("type", &self.transfer_type)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

fn notify(listener: &dyn TransferListener, event: &TransferEvent) {
    match event {
        TransferEvent::StateChanged { id, state } => listener.on_state_changed(*id, *state),
        TransferEvent::ProgressChanged {
            id,
            bytes_current,
            bytes_total,
        } => listener.on_progress_changed(*id, *bytes_current, *bytes_total),
        TransferEvent::Error { id, message } => listener.on_error(*id, message),
    }
}
