//! Transfer Worker
//!
//! Long-lived executor. A single dispatch loop owns the registry of running
//! tasks; each task moves bytes for one single transfer, one download, or
//! one multipart summary (whose parts run as sub-tasks). Pause and cancel
//! requests are flags checked at chunk boundaries, and only the task turns
//! them into PAUSED/CANCELED.
//!
//! A worker only runs while it holds the store's `WorkerLease`. Besides its
//! in-process command channel it drains commands that other processes queued
//! in the store.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use super::channel::{CommandReceiver, TransferCommand};
use super::db::TransferDb;
use super::error::TransferError;
use super::events::TransferEvents;
use super::lease::WorkerLease;
use super::remote::{ByteStream, CompletedPart, RemoteError, RemoteStore};
use super::state::TransferState;
use super::types::{TransferId, TransferRecord, TransferType};

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Execution slots shared by singles, downloads and parts
    pub concurrency: usize,
    /// Bytes per body chunk (one checkpoint per chunk)
    pub chunk_size: usize,
    /// Persist progress after this many new bytes
    pub progress_interval_bytes: u64,
    /// Periodic WAITING scan; `None` relies on commands alone
    pub scan_interval: Option<Duration>,
    /// How often commands queued by other processes are picked up
    pub command_poll_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            chunk_size: 64 * 1024,
            progress_interval_bytes: 1024 * 1024,
            scan_interval: Some(Duration::from_secs(30)),
            command_poll_interval: Some(Duration::from_secs(1)),
        }
    }
}

// ============================================================================
// Control flags
// ============================================================================

const SIGNAL_NONE: u8 = 0;
const SIGNAL_PAUSE: u8 = 1;
const SIGNAL_CANCEL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pause,
    Cancel,
}

impl Signal {
    fn state(self) -> TransferState {
        match self {
            Signal::Pause => TransferState::Paused,
            Signal::Cancel => TransferState::Canceled,
        }
    }

    fn code(self) -> u8 {
        match self {
            Signal::Pause => SIGNAL_PAUSE,
            Signal::Cancel => SIGNAL_CANCEL,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            SIGNAL_PAUSE => Some(Signal::Pause),
            SIGNAL_CANCEL => Some(Signal::Cancel),
            _ => None,
        }
    }
}

/// Per-task control block, shared by a summary and its parts
#[derive(Debug, Default)]
struct TransferControl {
    signal: AtomicU8,
    /// Sibling parts stop after a part failure
    halted: AtomicBool,
    /// A RESUME/ADD arrived while the task was still registered
    redispatch: AtomicBool,
}

impl TransferControl {
    /// Cancel wins over pause
    fn request(&self, signal: Signal) {
        self.signal.fetch_max(signal.code(), Ordering::SeqCst);
    }

    fn pending(&self) -> Option<Signal> {
        Signal::from_code(self.signal.load(Ordering::SeqCst))
    }

    /// Consume the pending signal
    fn take(&self) -> Option<Signal> {
        Signal::from_code(self.signal.swap(SIGNAL_NONE, Ordering::SeqCst))
    }

    /// Drop a pause that the task has not reached yet
    fn clear_pause(&self) {
        let _ = self.signal.compare_exchange(
            SIGNAL_PAUSE,
            SIGNAL_NONE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.pending().is_some() || self.halted.load(Ordering::SeqCst)
    }
}

/// Sent by a task when it has written its final state
struct TaskDone {
    id: TransferId,
    control: Arc<TransferControl>,
}

enum PartOutcome {
    Completed,
    Stopped,
    Failed(String),
}

// ============================================================================
// Progress
// ============================================================================

/// Buffers progress and persists it every `interval` bytes
struct ProgressSink {
    db: TransferDb,
    events: TransferEvents,
    id: TransferId,
    /// Parts roll their progress up into this summary
    summary: Option<TransferId>,
    current: u64,
    total: u64,
    persisted: u64,
    interval: u64,
}

impl ProgressSink {
    fn add(&mut self, bytes: u64) {
        self.current = (self.current + bytes).min(self.total);
    }

    fn current(&self) -> u64 {
        self.current
    }

    fn is_due(&self) -> bool {
        self.current - self.persisted >= self.interval
    }

    async fn persist(&mut self) -> Result<(), TransferError> {
        if self.current == self.persisted {
            return Ok(());
        }
        if !self.db.update_progress(self.id, self.current, None).await? {
            debug!(transfer_id = self.id, bytes = self.current, "Progress write refused");
        }
        self.persisted = self.current;

        match self.summary {
            Some(summary_id) => {
                if let Some((current, total)) = self.db.refresh_summary_progress(summary_id).await? {
                    self.events.progress(summary_id, current, total);
                }
            }
            None => self.events.progress(self.id, self.current, self.total),
        }
        Ok(())
    }
}

/// Upload body read from a file range, checking the control flag per chunk
struct FileBody {
    path: PathBuf,
    file: Option<fs::File>,
    offset: u64,
    remaining: u64,
    chunk_size: usize,
    /// Last chunk handed out, counted once the consumer asks for the next
    in_flight: u64,
    control: Arc<TransferControl>,
    progress: ProgressSink,
    done: bool,
}

impl FileBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.in_flight > 0 {
            self.progress.add(std::mem::take(&mut self.in_flight));
            if self.progress.is_due() {
                self.progress.persist().await.map_err(io::Error::other)?;
            }
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.control.should_stop() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "transfer stopped at checkpoint",
            ));
        }

        if self.file.is_none() {
            let mut file = fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(self.offset)).await?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("source file not open"));
        };

        let len = (self.chunk_size as u64).min(self.remaining) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        self.remaining -= len as u64;
        self.in_flight = len as u64;
        Ok(Some(buf))
    }

    fn into_stream(self) -> ByteStream {
        stream::unfold(self, |mut body| async move {
            if body.done {
                return None;
            }
            match body.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), body)),
                Ok(None) => None,
                Err(e) => {
                    body.done = true;
                    Some((Err(e), body))
                }
            }
        })
        .boxed()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Background executor for transfer records
#[derive(Clone)]
pub struct TransferWorker {
    db: TransferDb,
    remote: Arc<dyn RemoteStore>,
    events: TransferEvents,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    running: Arc<DashMap<TransferId, Arc<TransferControl>>>,
    idle: Arc<Notify>,
    /// Multipart aborts issued by cancels, off the dispatch loop
    aborts: Arc<Mutex<JoinSet<()>>>,
}

impl TransferWorker {
    pub fn new(
        db: TransferDb,
        remote: Arc<dyn RemoteStore>,
        events: TransferEvents,
        config: WorkerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            db,
            remote,
            events,
            config,
            slots,
            running: Arc::new(DashMap::new()),
            idle: Arc::new(Notify::new()),
            aborts: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Ids with a task currently registered
    pub fn running_ids(&self) -> Vec<TransferId> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_running(&self, id: TransferId) -> bool {
        self.running.contains_key(&id)
    }

    /// A pause/cancel is waiting for the task's next checkpoint
    pub fn stop_requested(&self, id: TransferId) -> bool {
        self.running
            .get(&id)
            .is_some_and(|control| control.pending().is_some())
    }

    /// Run the dispatch loop until every command sender is dropped
    ///
    /// Recovers interrupted records first, then dispatches everything
    /// WAITING. The lease is renewed on a heartbeat; if another process takes
    /// it over, running tasks are paused and the loop ends. Tasks still
    /// running when the channel closes are waited for.
    pub async fn run(self, lease: WorkerLease, mut commands: CommandReceiver) {
        info!(
            remote = self.remote.name(),
            holder = lease.holder(),
            concurrency = self.config.concurrency,
            scan_interval_ms = self.config.scan_interval.map(|d| d.as_millis() as u64),
            "Starting transfer worker"
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskDone>();

        match self.recover().await {
            Ok(0) => debug!("No interrupted transfers found"),
            Ok(count) => info!(count, "Recovered interrupted transfers"),
            Err(e) => error!(error = %e, "Startup recovery failed"),
        }
        if let Err(e) = self.poll_queued_commands(&done_tx).await {
            error!(error = %e, "Initial command poll failed");
        }
        if let Err(e) = self.scan_waiting(&done_tx).await {
            error!(error = %e, "Initial scan failed");
        }

        let mut heartbeat = periodic(lease.heartbeat_interval());
        let mut ticker = self.config.scan_interval.map(periodic);
        let mut inbox = self.config.command_poll_interval.map(periodic);
        let mut lease_lost = false;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if let Err(e) = self.handle(command, &done_tx).await {
                        error!(transfer_id = command.id(), command = command.as_str(), error = %e, "Command failed");
                    }
                }
                Some(done) = done_rx.recv() => {
                    self.finish_task(done, Some(&done_tx)).await;
                }
                _ = heartbeat.tick() => {
                    if !self.keep_lease(&lease).await {
                        lease_lost = true;
                        break;
                    }
                }
                _ = tick(&mut inbox) => {
                    if let Err(e) = self.poll_queued_commands(&done_tx).await {
                        error!(error = %e, "Command poll failed");
                    }
                }
                _ = tick(&mut ticker) => {
                    if let Err(e) = self.scan_waiting(&done_tx).await {
                        error!(error = %e, "Periodic scan failed");
                    }
                }
            }
        }

        if lease_lost {
            let paused = self.request_pause_all();
            error!(running = paused, "Worker lease taken over, pausing running transfers");
        } else {
            info!(running = self.running.len(), "Command channel closed, draining transfer worker");
        }
        while !self.running.is_empty() {
            tokio::select! {
                done = done_rx.recv() => match done {
                    Some(done) => self.finish_task(done, None).await,
                    None => break,
                },
                _ = heartbeat.tick(), if !lease_lost => {
                    if !self.keep_lease(&lease).await {
                        lease_lost = true;
                        self.request_pause_all();
                    }
                }
            }
        }
        self.flush_aborts().await;
        lease.release().await;
        info!("Transfer worker stopped");
    }

    /// Apply a pause/cancel without the dispatch loop
    ///
    /// For one-shot callers that hold the lease but never run the worker.
    /// ADD/RESUME need the loop and are left to the next `run`.
    pub async fn apply(&self, lease: &WorkerLease, command: TransferCommand) -> Result<(), TransferError> {
        if !lease.renew().await? {
            return Err(TransferError::ServiceUnavailable(
                "worker lease was taken over".to_string(),
            ));
        }
        let result = match command {
            TransferCommand::Pause(id) => self.control(id, Signal::Pause).await,
            TransferCommand::Cancel(id) => self.control(id, Signal::Cancel).await,
            TransferCommand::Add(id) | TransferCommand::Resume(id) => {
                debug!(transfer_id = id, command = command.as_str(), "Left for the dispatch loop");
                Ok(())
            }
        };
        self.flush_aborts().await;
        result
    }

    /// Pause every running task and wait until all of them stopped
    pub async fn shutdown(&self) {
        let count = self.request_pause_all();
        info!(count, "Pausing running transfers for shutdown");

        while !self.running.is_empty() {
            let notified = self.idle.notified();
            if self.running.is_empty() {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), notified).await;
        }
        self.flush_aborts().await;
    }

    fn request_pause_all(&self) -> usize {
        let mut count = 0;
        for entry in self.running.iter() {
            entry.value().request(Signal::Pause);
            count += 1;
        }
        count
    }

    /// Renew the lease; false once it belongs to another process
    async fn keep_lease(&self, lease: &WorkerLease) -> bool {
        match lease.renew().await {
            Ok(renewed) => renewed,
            Err(e) => {
                // the next heartbeat retries before the ttl runs out
                warn!(error = %e, "Worker lease renewal failed");
                true
            }
        }
    }

    /// Return records left IN_PROGRESS/PART_COMPLETED by a previous process to WAITING
    ///
    /// Only the lease holder calls this, so no other process owns them. The
    /// matching task re-validates them when it starts: downloads against the
    /// local file length, single uploads from byte 0, multipart uploads
    /// against the remote part list.
    async fn recover(&self) -> Result<usize, TransferError> {
        let stale = self
            .db
            .find_by_states(&[TransferState::InProgress, TransferState::PartCompleted])
            .await?;

        let mut recovered = 0;
        for record in &stale {
            if self.running.contains_key(&record.root_id()) {
                continue;
            }
            if record.is_part() {
                self.db
                    .update_state_if(record.id, TransferState::InProgress, TransferState::Waiting)
                    .await?;
                continue;
            }
            if self.db.mark_waiting_if(record.id, record.state).await? {
                debug!(transfer_id = record.id, state = %record.state, "Interrupted transfer queued again");
                self.events.state_changed(record.id, TransferState::Waiting);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Handle commands other processes parked in the store
    async fn poll_queued_commands(
        &self,
        done_tx: &mpsc::UnboundedSender<TaskDone>,
    ) -> Result<usize, TransferError> {
        let queued = self.db.take_queued_commands().await?;
        for command in &queued {
            if let Err(e) = self.handle(*command, done_tx).await {
                error!(transfer_id = command.id(), command = command.as_str(), error = %e, "Queued command failed");
            }
        }
        if !queued.is_empty() {
            debug!(count = queued.len(), "Handled queued commands");
        }
        Ok(queued.len())
    }

    async fn scan_waiting(&self, done_tx: &mpsc::UnboundedSender<TaskDone>) -> Result<usize, TransferError> {
        let mut ids = Vec::new();
        for transfer_type in [TransferType::Upload, TransferType::Download] {
            let waiting = self
                .db
                .query_by_type_and_state(transfer_type, TransferState::Waiting)
                .await?;
            ids.extend(waiting.into_iter().map(|r| r.id));
        }

        let mut dispatched = 0;
        for id in ids {
            if self.running.contains_key(&id) {
                continue;
            }
            match self.dispatch(id, done_tx).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => error!(transfer_id = id, error = %e, "Dispatch failed"),
            }
        }
        if dispatched > 0 {
            debug!(count = dispatched, "Scan dispatched waiting transfers");
        }
        Ok(dispatched)
    }

    async fn handle(
        &self,
        command: TransferCommand,
        done_tx: &mpsc::UnboundedSender<TaskDone>,
    ) -> Result<(), TransferError> {
        debug!(transfer_id = command.id(), command = command.as_str(), "Command received");
        match command {
            TransferCommand::Add(id) | TransferCommand::Resume(id) => {
                self.dispatch(id, done_tx).await.map(|_| ())
            }
            TransferCommand::Pause(id) => self.control(id, Signal::Pause).await,
            TransferCommand::Cancel(id) => self.control(id, Signal::Cancel).await,
        }
    }

    /// Start a task for a WAITING root record
    ///
    /// Returns false when nothing was started (duplicate, not runnable, gone).
    async fn dispatch(
        &self,
        id: TransferId,
        done_tx: &mpsc::UnboundedSender<TaskDone>,
    ) -> Result<bool, TransferError> {
        let Some(mut record) = self.root_record(id).await? else {
            debug!(transfer_id = id, "Record gone, nothing to dispatch");
            return Ok(false);
        };
        let id = record.id;

        if let Some(control) = self.running.get(&id) {
            debug!(transfer_id = id, "Task already running, duplicate signal ignored");
            control.clear_pause();
            control.redispatch.store(true, Ordering::SeqCst);
            return Ok(false);
        }

        match record.state {
            TransferState::Waiting => {}
            TransferState::InProgress | TransferState::PartCompleted => {
                // no task owns it, so it was interrupted
                if !self.db.mark_waiting_if(id, record.state).await? {
                    return Ok(false);
                }
                record.state = TransferState::Waiting;
            }
            other => {
                debug!(transfer_id = id, state = %other, "Not runnable, signal ignored");
                return Ok(false);
            }
        }

        let control = Arc::new(TransferControl::default());
        match self.running.entry(id) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(control.clone());
            }
        }

        let worker = self.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            worker.run_transfer(record, control.clone()).await;
            let _ = done_tx.send(TaskDone { id, control });
        });
        Ok(true)
    }

    /// Route a pause/cancel to the running task, or apply it to the store
    async fn control(&self, id: TransferId, signal: Signal) -> Result<(), TransferError> {
        let Some(record) = self.root_record(id).await? else {
            return Ok(());
        };
        let id = record.id;

        for _ in 0..3 {
            if let Some(control) = self.running.get(&id) {
                control.request(signal);
                debug!(transfer_id = id, signal = ?signal, "Signal delivered to running task");
                return Ok(());
            }

            let Some(record) = self.db.get(id).await? else {
                return Ok(());
            };
            let applicable = match signal {
                Signal::Pause => record.state.is_active(),
                Signal::Cancel => !record.state.is_terminal(),
            };
            if !applicable {
                debug!(transfer_id = id, state = %record.state, signal = ?signal, "Signal has nothing to stop");
                return Ok(());
            }
            if self.settle(id, signal, Some(record.state)).await? {
                return Ok(());
            }
        }

        warn!(transfer_id = id, signal = ?signal, "State kept changing, signal not applied");
        Ok(())
    }

    async fn finish_task(&self, done: TaskDone, done_tx: Option<&mpsc::UnboundedSender<TaskDone>>) {
        let id = done.id;
        self.running.remove(&id);
        self.idle.notify_waiters();

        // a request that landed after the task's last checkpoint
        if let Some(signal) = done.control.take() {
            if let Err(e) = self.control(id, signal).await {
                error!(transfer_id = id, error = %e, "Failed to apply late signal");
            }
        }
        if done.control.redispatch.load(Ordering::SeqCst) {
            if let Some(done_tx) = done_tx {
                if let Err(e) = self.dispatch(id, done_tx).await {
                    error!(transfer_id = id, error = %e, "Redispatch failed");
                }
            }
        }
    }

    async fn run_transfer(&self, record: TransferRecord, control: Arc<TransferControl>) {
        let id = record.id;
        let is_summary = record.is_summary();

        let result = if is_summary {
            self.run_multipart(record, &control).await
        } else {
            match record.transfer_type {
                TransferType::Upload => self.run_single_upload(record, &control).await,
                TransferType::Download => self.run_download(record, &control).await,
            }
        };

        match result {
            Ok(state) => debug!(transfer_id = id, state = %state, "Transfer task finished"),
            Err(e) => {
                error!(transfer_id = id, error = %e, "Transfer task aborted");
                if let Err(e) = self.fail(id, is_summary, &e.to_string()).await {
                    error!(transfer_id = id, error = %e, "Could not record failure");
                }
            }
        }
    }

    // ========================================================================
    // Single upload
    // ========================================================================

    async fn run_single_upload(
        &self,
        record: TransferRecord,
        control: &Arc<TransferControl>,
    ) -> Result<TransferState, TransferError> {
        let id = record.id;
        let _slot = self.acquire_slot().await?;
        if let Some(state) = self.preempt(id, control).await? {
            return Ok(state);
        }

        // parts of an object are not resumable, start over
        self.db.rewind_progress(id, 0).await?;
        if !self.claim(&record).await? {
            return self.current_state(id).await;
        }

        let file_len = match fs::metadata(&record.file_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let message = format!("cannot read {}: {}", record.file_path.display(), e);
                return self.fail(id, false, &message).await;
            }
        };
        if file_len != record.bytes_total {
            let message = format!(
                "source file changed size from {} to {} bytes",
                record.bytes_total, file_len
            );
            return self.fail(id, false, &message).await;
        }

        let body = self.file_body(&record, control.clone());
        let result = self
            .remote
            .put_object(
                &record.bucket,
                &record.key,
                body,
                record.bytes_total,
                &record.metadata,
            )
            .await;

        match result {
            Ok(etag) => self.complete(id, record.bytes_total, Some(&etag)).await,
            Err(e) => self.stop_or_fail(id, false, control, &e).await,
        }
    }

    // ========================================================================
    // Download
    // ========================================================================

    async fn run_download(
        &self,
        record: TransferRecord,
        control: &Arc<TransferControl>,
    ) -> Result<TransferState, TransferError> {
        let id = record.id;
        let _slot = self.acquire_slot().await?;
        if let Some(state) = self.preempt(id, control).await? {
            return Ok(state);
        }

        // resume only from bytes actually on disk
        let on_disk = match fs::metadata(&record.file_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                let message = format!("cannot inspect {}: {}", record.file_path.display(), e);
                return self.fail(id, false, &message).await;
            }
        };
        let mut offset = record.bytes_current;
        if on_disk < offset {
            self.db.rewind_progress(id, on_disk).await?;
            offset = on_disk;
        }
        if !self.claim(&record).await? {
            return self.current_state(id).await;
        }

        let mut file = match open_for_resume(&record.file_path, offset).await {
            Ok(file) => file,
            Err(e) => {
                let message = format!("cannot open {}: {}", record.file_path.display(), e);
                return self.fail(id, false, &message).await;
            }
        };

        let range = (offset > 0).then_some(offset);
        let object = match self.remote.get_object(&record.bucket, &record.key, range).await {
            Ok(object) => object,
            Err(e) => return self.stop_or_fail(id, false, control, &e).await,
        };

        let total = offset + object.content_length;
        if total != record.bytes_total && !self.db.set_bytes_total(id, total).await? {
            let message = format!("remote object shrank to {} bytes", total);
            return self.fail(id, false, &message).await;
        }
        debug!(transfer_id = id, offset, total, "Download started");

        let mut progress = self.progress_sink(&record, offset, total);
        let mut stream = object.stream;
        loop {
            if let Some(signal) = control.take() {
                file.flush().await?;
                progress.persist().await?;
                self.settle(id, signal, None).await?;
                return Ok(signal.state());
            }

            match stream.next().await {
                Some(Ok(chunk)) => {
                    if progress.current() + chunk.len() as u64 > total {
                        file.flush().await?;
                        progress.persist().await?;
                        let message = format!("object sent more than the {} bytes announced", total);
                        return self.fail(id, false, &message).await;
                    }
                    if let Err(e) = file.write_all(&chunk).await {
                        progress.persist().await?;
                        let message = format!("write {}: {}", record.file_path.display(), e);
                        return self.fail(id, false, &message).await;
                    }
                    progress.add(chunk.len() as u64);
                    if progress.is_due() {
                        file.flush().await?;
                        progress.persist().await?;
                    }
                }
                Some(Err(e)) => {
                    file.flush().await?;
                    progress.persist().await?;
                    return self
                        .stop_or_fail(id, false, control, &RemoteError::from(e))
                        .await;
                }
                None => break,
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        progress.persist().await?;
        if progress.current() != total {
            let message = format!(
                "object ended after {} of {} bytes",
                progress.current(),
                total
            );
            return self.fail(id, false, &message).await;
        }
        self.complete(id, total, None).await
    }

    // ========================================================================
    // Multipart upload
    // ========================================================================

    async fn run_multipart(
        &self,
        summary: TransferRecord,
        control: &Arc<TransferControl>,
    ) -> Result<TransferState, TransferError> {
        let id = summary.id;
        if let Some(state) = self.preempt(id, control).await? {
            return Ok(state);
        }
        // parts are only touched once the summary is ours
        if !self.claim(&summary).await? {
            return self.current_state(id).await;
        }

        let mut upload_id = None;
        if let Some(existing) = summary.multipart_id.as_deref() {
            match self.reconcile_parts(&summary, existing).await {
                Ok(confirmed) => upload_id = confirmed,
                Err(e) => return self.fail(id, true, &e.to_string()).await,
            }
        }

        for part in self.db.get_parts(id).await? {
            if part.state != TransferState::Completed {
                self.db.reset_part(part.id).await?;
            }
        }
        self.db.refresh_summary_progress(id).await?;
        if let Some(signal) = control.take() {
            self.settle(id, signal, None).await?;
            return Ok(signal.state());
        }

        let upload_id = match upload_id {
            Some(upload_id) => upload_id,
            None => {
                let initiated = self
                    .remote
                    .initiate_multipart(&summary.bucket, &summary.key, &summary.metadata)
                    .await;
                match initiated {
                    Ok(upload_id) => {
                        self.db.set_multipart_id(id, Some(&upload_id)).await?;
                        info!(transfer_id = id, upload_id = %upload_id, "Multipart upload initiated");
                        upload_id
                    }
                    Err(e) => return self.stop_or_fail(id, true, control, &e).await,
                }
            }
        };

        let parts = self.db.get_parts(id).await?;
        let part_count = parts.len();
        let mut completed = parts
            .iter()
            .filter(|p| p.state == TransferState::Completed)
            .count();
        let mut state = TransferState::InProgress;
        if completed > 0 && completed < part_count {
            state = self.mark_part_completed(id).await?;
        }

        let mut tasks = JoinSet::new();
        for part in parts
            .into_iter()
            .filter(|p| p.state != TransferState::Completed)
        {
            let worker = self.clone();
            let control = control.clone();
            let upload_id = upload_id.clone();
            tasks.spawn(async move { worker.run_part(part, upload_id, control).await });
        }

        let mut failure: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| TransferError::IoError(format!("part task ended abnormally: {}", e)))
                .and_then(|outcome| outcome);
            match outcome {
                Ok(PartOutcome::Completed) => {
                    completed += 1;
                    if state == TransferState::InProgress && completed < part_count {
                        state = self.mark_part_completed(id).await?;
                    }
                }
                Ok(PartOutcome::Stopped) => {}
                Ok(PartOutcome::Failed(message)) => {
                    control.halt();
                    failure.get_or_insert(message);
                }
                Err(e) => {
                    control.halt();
                    failure.get_or_insert(e.to_string());
                }
            }
        }

        if let Some(signal) = control.take() {
            self.settle(id, signal, None).await?;
            return Ok(signal.state());
        }
        if let Some(message) = failure {
            return self.fail(id, true, &message).await;
        }

        let mut completed_parts = Vec::with_capacity(part_count);
        for part in self.db.get_parts(id).await? {
            match (part.state, part.etag) {
                (TransferState::Completed, Some(etag)) => completed_parts.push(CompletedPart {
                    part_number: part.part_num,
                    etag,
                }),
                _ => {
                    let message = format!("part {} did not complete", part.part_num);
                    return self.fail(id, true, &message).await;
                }
            }
        }

        match self
            .remote
            .complete_multipart(&summary.bucket, &summary.key, &upload_id, &completed_parts)
            .await
        {
            Ok(etag) => self.complete(id, summary.bytes_total, Some(&etag)).await,
            Err(e) => self.stop_or_fail(id, true, control, &e).await,
        }
    }

    async fn run_part(
        self,
        part: TransferRecord,
        upload_id: String,
        control: Arc<TransferControl>,
    ) -> Result<PartOutcome, TransferError> {
        let _slot = self.acquire_slot().await?;
        if control.should_stop() {
            return Ok(PartOutcome::Stopped);
        }
        if !self
            .db
            .update_state_if(part.id, TransferState::Waiting, TransferState::InProgress)
            .await?
        {
            return Ok(PartOutcome::Stopped);
        }

        let summary_id = part.root_id();
        let body = self.file_body(&part, control.clone());
        let result = self
            .remote
            .upload_part(
                &part.bucket,
                &part.key,
                &upload_id,
                part.part_num,
                body,
                part.bytes_total,
            )
            .await;

        match result {
            Ok(etag) => {
                self.db.complete_part(part.id, &etag).await?;
                if let Some((current, total)) = self.db.refresh_summary_progress(summary_id).await? {
                    self.events.progress(summary_id, current, total);
                }
                debug!(transfer_id = summary_id, part = part.part_num, "Part uploaded");
                Ok(PartOutcome::Completed)
            }
            Err(_) if control.should_stop() => Ok(PartOutcome::Stopped),
            Err(e) => {
                let message = format!("part {}: {}", part.part_num, e);
                self.db
                    .update_state_with_error(part.id, TransferState::Failed, &message)
                    .await?;
                Ok(PartOutcome::Failed(message))
            }
        }
    }

    /// Check an existing multipart upload against the remote part list
    ///
    /// Returns the upload id if it still exists. Parts recorded COMPLETED that
    /// the remote does not confirm are reset; if the upload is gone every part
    /// is reset and the upload id cleared.
    async fn reconcile_parts(
        &self,
        summary: &TransferRecord,
        upload_id: &str,
    ) -> Result<Option<String>, TransferError> {
        match self
            .remote
            .list_parts(&summary.bucket, &summary.key, upload_id)
            .await
        {
            Ok(remote_parts) => {
                let confirmed: HashMap<u32, String> = remote_parts
                    .into_iter()
                    .map(|p| (p.part_number, p.etag))
                    .collect();
                for part in self.db.get_parts(summary.id).await? {
                    if part.state == TransferState::Completed
                        && confirmed.get(&part.part_num) != part.etag.as_ref()
                    {
                        warn!(
                            transfer_id = summary.id,
                            part = part.part_num,
                            "Completed part not confirmed by remote, uploading again"
                        );
                        self.db.reset_part(part.id).await?;
                    }
                }
                Ok(Some(upload_id.to_string()))
            }
            Err(RemoteError::NoSuchUpload(_)) => {
                warn!(
                    transfer_id = summary.id,
                    upload_id, "Multipart upload no longer exists, restarting every part"
                );
                for part in self.db.get_parts(summary.id).await? {
                    self.db.reset_part(part.id).await?;
                }
                self.db.set_multipart_id(summary.id, None).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // State writes
    // ========================================================================

    /// WAITING -> IN_PROGRESS; false if something else changed the record
    async fn claim(&self, record: &TransferRecord) -> Result<bool, TransferError> {
        if !self
            .db
            .update_state_if(record.id, TransferState::Waiting, TransferState::InProgress)
            .await?
        {
            debug!(transfer_id = record.id, "Record left WAITING before the task started");
            return Ok(false);
        }
        self.events
            .state_changed(record.id, TransferState::InProgress);
        info!(
            transfer_id = record.id,
            transfer_type = %record.transfer_type,
            bucket = %record.bucket,
            key = %record.key,
            "Transfer started"
        );
        Ok(true)
    }

    /// Honor a signal that arrived before the task claimed its record
    async fn preempt(
        &self,
        id: TransferId,
        control: &TransferControl,
    ) -> Result<Option<TransferState>, TransferError> {
        let Some(signal) = control.take() else {
            return Ok(None);
        };
        if self.settle(id, signal, Some(TransferState::Waiting)).await? {
            Ok(Some(signal.state()))
        } else {
            self.current_state(id).await.map(Some)
        }
    }

    /// Write PAUSED/CANCELED for a record and its parts, then publish
    ///
    /// With `expected` the write is a CAS from that state. Canceling a
    /// summary aborts its multipart upload in the background (best effort).
    async fn settle(
        &self,
        id: TransferId,
        signal: Signal,
        expected: Option<TransferState>,
    ) -> Result<bool, TransferError> {
        let Some(record) = self.db.get(id).await? else {
            return Ok(false);
        };
        let target = signal.state();

        let moved = match expected {
            Some(from) => self.db.update_state_if(id, from, target).await?,
            None => self.db.update_state(id, target).await?,
        };
        if !moved {
            return Ok(false);
        }

        if record.is_summary() {
            let from: &[TransferState] = match signal {
                Signal::Pause => &[TransferState::Waiting, TransferState::InProgress],
                Signal::Cancel => &[
                    TransferState::Waiting,
                    TransferState::InProgress,
                    TransferState::Paused,
                    TransferState::Failed,
                ],
            };
            self.db.update_group_state(id, from, target).await?;

            if signal == Signal::Cancel {
                if let Some(upload_id) = record.multipart_id.clone() {
                    self.db.set_multipart_id(id, None).await?;
                    self.spawn_abort(record, upload_id);
                }
            }
        }

        self.events.state_changed(id, target);
        info!(transfer_id = id, state = %target, "Transfer stopped on request");
        Ok(true)
    }

    fn spawn_abort(&self, record: TransferRecord, upload_id: String) {
        let remote = self.remote.clone();
        let mut aborts = self.aborts.lock().unwrap_or_else(PoisonError::into_inner);
        while aborts.try_join_next().is_some() {}
        aborts.spawn(async move { abort_upload(remote.as_ref(), &record, &upload_id).await });
    }

    /// Wait for every abort spawned so far
    async fn flush_aborts(&self) {
        let mut pending =
            std::mem::take(&mut *self.aborts.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Abort task ended abnormally");
            }
        }
    }

    /// A remote error after a pause/cancel request is the stop, not a failure
    async fn stop_or_fail(
        &self,
        id: TransferId,
        is_summary: bool,
        control: &TransferControl,
        error: &RemoteError,
    ) -> Result<TransferState, TransferError> {
        match control.take() {
            Some(signal) => {
                self.settle(id, signal, None).await?;
                Ok(signal.state())
            }
            None => self.fail(id, is_summary, &error.to_string()).await,
        }
    }

    async fn fail(
        &self,
        id: TransferId,
        is_summary: bool,
        message: &str,
    ) -> Result<TransferState, TransferError> {
        self.db
            .update_state_with_error(id, TransferState::Failed, message)
            .await?;
        if is_summary {
            self.db
                .update_group_state(
                    id,
                    &[TransferState::Waiting, TransferState::InProgress],
                    TransferState::Failed,
                )
                .await?;
        }
        self.events.error(id, message);
        self.events.state_changed(id, TransferState::Failed);
        warn!(transfer_id = id, error = message, "Transfer failed");
        Ok(TransferState::Failed)
    }

    async fn complete(
        &self,
        id: TransferId,
        total: u64,
        etag: Option<&str>,
    ) -> Result<TransferState, TransferError> {
        self.db.update_progress(id, total, etag).await?;
        self.db.update_state(id, TransferState::Completed).await?;
        self.events.progress(id, total, total);
        self.events.state_changed(id, TransferState::Completed);
        info!(transfer_id = id, bytes = total, "Transfer completed");
        Ok(TransferState::Completed)
    }

    async fn mark_part_completed(&self, id: TransferId) -> Result<TransferState, TransferError> {
        if self
            .db
            .update_state_if(id, TransferState::InProgress, TransferState::PartCompleted)
            .await?
        {
            self.events.state_changed(id, TransferState::PartCompleted);
            return Ok(TransferState::PartCompleted);
        }
        self.current_state(id).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn root_record(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        match self.db.get(id).await? {
            Some(record) => match record.main_upload_id {
                Some(root) => self.db.get(root).await,
                None => Ok(Some(record)),
            },
            None => Ok(None),
        }
    }

    async fn current_state(&self, id: TransferId) -> Result<TransferState, TransferError> {
        self.db
            .get(id)
            .await?
            .map(|r| r.state)
            .ok_or(TransferError::TransferNotFound(id))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ServiceUnavailable("worker slots closed".to_string()))
    }

    fn progress_sink(&self, record: &TransferRecord, current: u64, total: u64) -> ProgressSink {
        ProgressSink {
            db: self.db.clone(),
            events: self.events.clone(),
            id: record.id,
            summary: record.main_upload_id,
            current,
            total,
            persisted: current,
            interval: self.config.progress_interval_bytes.max(1),
        }
    }

    fn file_body(&self, record: &TransferRecord, control: Arc<TransferControl>) -> ByteStream {
        FileBody {
            path: record.file_path.clone(),
            file: None,
            offset: record.file_offset,
            remaining: record.bytes_total,
            chunk_size: self.config.chunk_size.max(1),
            in_flight: 0,
            control,
            progress: self.progress_sink(record, 0, record.bytes_total),
            done: false,
        }
        .into_stream()
    }
}

async fn abort_upload(remote: &dyn RemoteStore, record: &TransferRecord, upload_id: &str) {
    match remote
        .abort_multipart(&record.bucket, &record.key, upload_id)
        .await
    {
        Ok(()) => info!(transfer_id = record.id, upload_id, "Multipart upload aborted"),
        Err(RemoteError::NoSuchUpload(_)) => {
            debug!(transfer_id = record.id, upload_id, "Multipart upload already gone")
        }
        Err(e) => warn!(
            transfer_id = record.id,
            upload_id,
            error = %e,
            "Abort multipart upload failed"
        ),
    }
}

/// Ticks every `period`, first tick one period from now
fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Open the download target positioned at `offset`, dropping anything past it
async fn open_for_resume(path: &Path, offset: u64) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(path)
        .await?;
    if offset > 0 {
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.scan_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.command_poll_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_cancel_overrides_pause() {
        let control = TransferControl::default();
        assert!(control.pending().is_none());

        control.request(Signal::Pause);
        assert_eq!(control.pending(), Some(Signal::Pause));
        control.request(Signal::Cancel);
        control.request(Signal::Pause);
        assert_eq!(control.pending(), Some(Signal::Cancel));

        control.clear_pause();
        assert_eq!(control.take(), Some(Signal::Cancel));
        control.request(Signal::Pause);
        control.clear_pause();
        assert!(control.pending().is_none());
        assert!(control.take().is_none());
        assert!(!control.should_stop());
    }

    #[test]
    fn test_halt_stops_without_signal() {
        let control = TransferControl::default();
        control.halt();
        assert!(control.should_stop());
        assert!(control.pending().is_none());
    }

    #[tokio::test]
    async fn test_open_for_resume_truncates_past_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");

        let mut file = open_for_resume(&path, 0).await.unwrap();
        file.write_all(b"0123456789").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut file = open_for_resume(&path, 4).await.unwrap();
        file.write_all(b"xy").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123xy".to_vec());

        open_for_resume(&path, 0).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_file_body_stops_at_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let db = TransferDb::in_memory().await.unwrap();
        let control = Arc::new(TransferControl::default());
        let body = FileBody {
            path,
            file: None,
            offset: 2,
            remaining: 6,
            chunk_size: 4,
            in_flight: 0,
            control: control.clone(),
            progress: ProgressSink {
                db,
                events: TransferEvents::default(),
                id: 1,
                summary: None,
                current: 0,
                total: 6,
                persisted: 0,
                interval: u64::MAX,
            },
            done: false,
        };
        let mut stream = body.into_stream();

        assert_eq!(stream.next().await.unwrap().unwrap(), b"cdef".to_vec());
        control.request(Signal::Pause);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(stream.next().await.is_none());
    }
}
