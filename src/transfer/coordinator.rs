//! Transfer Coordinator
//!
//! Public control surface. Every call is a short record-store write plus a
//! non-blocking command to the worker; the coordinator never touches the
//! remote store. Without a worker in this process, commands are queued in
//! the store for the lease holder. Pause and cancel of a running transfer are requests: the
//! worker applies them at its next checkpoint.

use std::path::{Component, Path};

use tracing::{debug, info, warn};

use super::channel::{CommandSender, TransferCommand};
use super::db::TransferDb;
use super::error::TransferError;
use super::events::TransferEvents;
use super::observer::TransferObserver;
use super::planner::{PartPlanConfig, plan_with};
use super::state::TransferState;
use super::types::{Metadata, NewTransfer, TransferId, TransferRecord, TransferRequest, TransferType};

/// CAS retries before a control call reports ConcurrentModification
const MAX_CAS_ATTEMPTS: usize = 3;

/// Transfer Coordinator - caller-side entry point
pub struct TransferCoordinator {
    db: TransferDb,
    commands: CommandSender,
    events: TransferEvents,
    plan: PartPlanConfig,
}

impl TransferCoordinator {
    pub fn new(
        db: TransferDb,
        commands: CommandSender,
        events: TransferEvents,
        plan: PartPlanConfig,
    ) -> Self {
        Self {
            db,
            commands,
            events,
            plan,
        }
    }

    pub fn db(&self) -> &TransferDb {
        &self.db
    }

    pub fn events(&self) -> &TransferEvents {
        &self.events
    }

    /// Create the record(s) for a transfer and hand them to the worker
    ///
    /// # Validation
    /// - bucket, key and path must be non-empty
    /// - upload: path must be an existing regular file
    /// - download: path must name a file, must not be an existing directory,
    ///   and must not contain `..`
    pub async fn start(&self, req: TransferRequest) -> Result<TransferObserver, TransferError> {
        if req.bucket.trim().is_empty() {
            return Err(TransferError::InvalidInput("bucket must not be empty".to_string()));
        }
        if req.key.trim().is_empty() {
            return Err(TransferError::InvalidInput("key must not be empty".to_string()));
        }
        if req.file_path.as_os_str().is_empty() {
            return Err(TransferError::InvalidInput("file path must not be empty".to_string()));
        }

        let id = match req.direction {
            TransferType::Upload => self.create_upload(&req).await?,
            TransferType::Download => self.create_download(&req).await?,
        };

        let record = self
            .db
            .get(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))?;
        info!(
            transfer_id = id,
            transfer_type = %record.transfer_type,
            bucket = %record.bucket,
            key = %record.key,
            bytes_total = record.bytes_total,
            multipart = record.is_multipart,
            "Transfer created"
        );

        // record is durable; a worker started later picks it up by scan
        if let Err(e) = self.signal(TransferCommand::Add(id)).await {
            warn!(transfer_id = id, error = %e, "Worker not reachable, transfer left WAITING");
        }

        Ok(self.observer(&record))
    }

    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        file_path: impl AsRef<Path>,
        metadata: Metadata,
    ) -> Result<TransferObserver, TransferError> {
        let req = TransferRequest::upload(bucket, key, file_path.as_ref()).with_metadata(metadata);
        self.start(req).await
    }

    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        file_path: impl AsRef<Path>,
    ) -> Result<TransferObserver, TransferError> {
        self.start(TransferRequest::download(bucket, key, file_path.as_ref()))
            .await
    }

    async fn create_upload(&self, req: &TransferRequest) -> Result<TransferId, TransferError> {
        let meta = tokio::fs::metadata(&req.file_path).await.map_err(|e| {
            TransferError::InvalidInput(format!("{}: {}", req.file_path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(TransferError::InvalidInput(format!(
                "{} is not a regular file",
                req.file_path.display()
            )));
        }

        let size = meta.len();
        let plan = plan_with(size, &self.plan);
        let summary = NewTransfer::single(
            TransferType::Upload,
            &req.bucket,
            &req.key,
            &req.file_path,
            size,
            req.metadata.clone(),
        );
        if !plan.is_multipart() {
            return self.db.insert_single(&summary).await;
        }

        let parts: Vec<NewTransfer> = plan
            .parts()
            .iter()
            .map(|p| NewTransfer {
                file_offset: p.offset,
                bytes_total: p.size,
                part_num: p.part_number,
                is_last_part: p.is_last,
                is_multipart: true,
                metadata: Metadata::new(),
                ..summary.clone()
            })
            .collect();
        let summary = NewTransfer {
            is_multipart: true,
            ..summary
        };

        let ids = self.db.insert_multipart(&summary, &parts).await?;
        debug!(transfer_id = ids[0], parts = parts.len(), "Multipart group created");
        Ok(ids[0])
    }

    async fn create_download(&self, req: &TransferRequest) -> Result<TransferId, TransferError> {
        let path = &req.file_path;
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(TransferError::InvalidInput(format!(
                "{} escapes its directory",
                path.display()
            )));
        }
        if path.file_name().is_none() {
            return Err(TransferError::InvalidInput(format!(
                "{} does not name a file",
                path.display()
            )));
        }
        if let Ok(meta) = tokio::fs::metadata(path).await
            && meta.is_dir()
        {
            return Err(TransferError::InvalidInput(format!(
                "{} is a directory",
                path.display()
            )));
        }

        let record = NewTransfer::single(
            TransferType::Download,
            &req.bucket,
            &req.key,
            path,
            0,
            Metadata::new(),
        );
        self.db.insert_single(&record).await
    }

    /// Ask a transfer to stop and keep its progress
    ///
    /// A WAITING record becomes PAUSED immediately. A running one becomes
    /// PAUSED once the worker reaches a checkpoint. Other states are left
    /// alone.
    pub async fn pause(&self, id: TransferId) -> Result<(), TransferError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.root(id).await?;
            match record.state {
                TransferState::Waiting => {
                    if !self
                        .db
                        .update_state_if(record.id, TransferState::Waiting, TransferState::Paused)
                        .await?
                    {
                        continue;
                    }
                    if record.is_summary() {
                        self.db
                            .update_group_state(
                                record.id,
                                &[TransferState::Waiting],
                                TransferState::Paused,
                            )
                            .await?;
                    }
                    self.events.state_changed(record.id, TransferState::Paused);
                    info!(transfer_id = record.id, "Transfer paused");
                    // a task may already hold the record
                    self.signal(TransferCommand::Pause(record.id)).await?;
                    return Ok(());
                }
                TransferState::InProgress | TransferState::PartCompleted => {
                    self.signal(TransferCommand::Pause(record.id)).await?;
                    return Ok(());
                }
                other => {
                    debug!(transfer_id = record.id, state = %other, "Nothing to pause");
                    return Ok(());
                }
            }
        }
        Err(TransferError::ConcurrentModification(id))
    }

    /// Move a stopped transfer back to WAITING and dispatch it
    ///
    /// PAUSED and FAILED keep their progress; CANCELED restarts from byte 0
    /// with a fresh multipart upload. WAITING/IN_PROGRESS only re-signal the
    /// worker. COMPLETED is rejected.
    pub async fn resume(&self, id: TransferId) -> Result<TransferObserver, TransferError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.root(id).await?;
            let moved = match record.state {
                TransferState::Completed => {
                    return Err(TransferError::InvalidStateTransition(format!(
                        "transfer {} is already COMPLETED",
                        record.id
                    )));
                }
                TransferState::Waiting
                | TransferState::InProgress
                | TransferState::PartCompleted => {
                    self.signal(TransferCommand::Resume(record.id)).await?;
                    return Ok(self.observer(&record));
                }
                TransferState::Paused | TransferState::Failed => {
                    let moved = self.db.mark_waiting_if(record.id, record.state).await?;
                    if moved && record.is_summary() {
                        self.db
                            .update_group_state(
                                record.id,
                                &[
                                    TransferState::Paused,
                                    TransferState::Failed,
                                    TransferState::Canceled,
                                ],
                                TransferState::Waiting,
                            )
                            .await?;
                    }
                    moved
                }
                TransferState::Canceled => {
                    self.db
                        .reset_for_restart(record.id, TransferState::Canceled)
                        .await?
                }
            };

            if moved {
                self.events.state_changed(record.id, TransferState::Waiting);
                info!(transfer_id = record.id, from = %record.state, "Transfer resumed");
                self.signal(TransferCommand::Resume(record.id)).await?;
                let record = self.root(record.id).await?;
                return Ok(self.observer(&record));
            }
            debug!(transfer_id = record.id, "Resume lost a state race, retrying");
        }
        Err(TransferError::ConcurrentModification(id))
    }

    /// Ask a transfer to stop for good
    ///
    /// Idle records (WAITING, PAUSED, FAILED without a remote upload) become
    /// CANCELED right away. Anything else is CANCELED by the worker once it
    /// stops. Canceling a COMPLETED or CANCELED transfer is a no-op.
    pub async fn cancel(&self, id: TransferId) -> Result<(), TransferError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.root(id).await?;
            match record.state {
                TransferState::Canceled | TransferState::Completed => return Ok(()),
                TransferState::Waiting | TransferState::Paused | TransferState::Failed
                    if record.multipart_id.is_none() =>
                {
                    if !self
                        .db
                        .update_state_if(record.id, record.state, TransferState::Canceled)
                        .await?
                    {
                        continue;
                    }
                    if record.is_summary() {
                        self.db
                            .update_group_state(
                                record.id,
                                &[
                                    TransferState::Waiting,
                                    TransferState::Paused,
                                    TransferState::Failed,
                                ],
                                TransferState::Canceled,
                            )
                            .await?;
                    }
                    self.events.state_changed(record.id, TransferState::Canceled);
                    info!(transfer_id = record.id, "Transfer canceled");
                    self.signal(TransferCommand::Cancel(record.id)).await?;
                    return Ok(());
                }
                _ => {
                    self.signal(TransferCommand::Cancel(record.id)).await?;
                    return Ok(());
                }
            }
        }
        Err(TransferError::ConcurrentModification(id))
    }

    /// Cancel, then delete the record and its parts
    ///
    /// Fails with BusyCannotDelete while the worker has not yet confirmed
    /// the cancel; retry after observing CANCELED.
    pub async fn delete_transfer_record(&self, id: TransferId) -> Result<(), TransferError> {
        self.cancel(id).await?;

        let record = self.root(id).await?;
        if !record.state.is_terminal() {
            return Err(TransferError::BusyCannotDelete(record.id));
        }
        if record.is_summary() {
            let parts = self.db.get_parts(record.id).await?;
            if parts.iter().any(|p| p.state == TransferState::InProgress) {
                return Err(TransferError::BusyCannotDelete(record.id));
            }
        }

        let removed = self.db.delete(record.id).await?;
        info!(transfer_id = record.id, rows = removed, "Transfer record deleted");
        Ok(())
    }

    /// Pause every transfer of a direction; returns how many were handled
    pub async fn pause_all_with_type(&self, transfer_type: TransferType) -> Result<usize, TransferError> {
        let records = self.db.query_by_type(transfer_type).await?;
        let mut handled = 0;
        for record in records.iter().filter(|r| r.state.is_active()) {
            match self.pause(record.id).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(transfer_id = record.id, error = %e, "Pause failed"),
            }
        }
        Ok(handled)
    }

    /// Cancel every transfer of a direction; returns how many were handled
    pub async fn cancel_all_with_type(&self, transfer_type: TransferType) -> Result<usize, TransferError> {
        let records = self.db.query_by_type(transfer_type).await?;
        let mut handled = 0;
        for record in records.iter().filter(|r| !r.state.is_terminal()) {
            match self.cancel(record.id).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(transfer_id = record.id, error = %e, "Cancel failed"),
            }
        }
        Ok(handled)
    }

    pub async fn get_transfer_by_id(&self, id: TransferId) -> Result<TransferObserver, TransferError> {
        TransferObserver::bind(self.db.clone(), self.events.clone(), id).await
    }

    /// Observers for every (non-part) transfer of a direction
    pub async fn get_transfers_with_type(
        &self,
        transfer_type: TransferType,
    ) -> Result<Vec<TransferObserver>, TransferError> {
        let records = self.db.query_by_type(transfer_type).await?;
        Ok(records.iter().map(|r| self.observer(r)).collect())
    }

    pub async fn get_transfers_with_type_and_state(
        &self,
        transfer_type: TransferType,
        state: TransferState,
    ) -> Result<Vec<TransferObserver>, TransferError> {
        let records = self
            .db
            .query_by_type_and_state(transfer_type, state)
            .await?;
        Ok(records.iter().map(|r| self.observer(r)).collect())
    }

    /// The record owning `id`'s control flag (the summary for a part)
    async fn root(&self, id: TransferId) -> Result<TransferRecord, TransferError> {
        let record = self
            .db
            .get(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))?;
        match record.main_upload_id {
            Some(summary_id) => self
                .db
                .get(summary_id)
                .await?
                .ok_or(TransferError::TransferNotFound(summary_id)),
            None => Ok(record),
        }
    }

    fn observer(&self, record: &TransferRecord) -> TransferObserver {
        TransferObserver::from_record(self.db.clone(), self.events.clone(), record)
    }

    /// Best-effort signal; the periodic scan covers a worker that is down
    /// Hand a command to the in-process worker, or queue it in the store
    /// for the process that holds the worker lease
    async fn signal(&self, command: TransferCommand) -> Result<(), TransferError> {
        if self.commands.send(command).is_ok() {
            return Ok(());
        }
        self.db.queue_command(command).await?;
        debug!(
            transfer_id = command.id(),
            command = command.as_str(),
            "No local worker, command queued for the lease holder"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::channel::{CommandReceiver, command_channel};

    async fn setup() -> (TransferCoordinator, CommandReceiver, tempfile::TempDir) {
        let db = TransferDb::in_memory().await.unwrap();
        let (tx, rx) = command_channel();
        let plan = PartPlanConfig {
            min_part_size: 4,
            max_parts: 100,
        };
        let coordinator = TransferCoordinator::new(db, tx, TransferEvents::default(), plan);
        (coordinator, rx, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn test_start_upload_single() {
        let (coordinator, mut rx, dir) = setup().await;
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"abc").unwrap();

        let observer = coordinator
            .upload("bucket", "small", &path, Metadata::new())
            .await
            .unwrap();
        assert_eq!(observer.state(), TransferState::Waiting);
        assert_eq!(observer.bytes_total(), 3);
        assert_eq!(rx.try_recv(), Some(TransferCommand::Add(observer.id())));

        let record = coordinator.db().get(observer.id()).await.unwrap().unwrap();
        assert!(!record.is_multipart);
    }

    #[tokio::test]
    async fn test_start_upload_multipart_plans_parts() {
        let (coordinator, _rx, dir) = setup().await;
        let path = dir.path().join("big.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let observer = coordinator
            .upload("bucket", "big", &path, Metadata::new())
            .await
            .unwrap();
        let parts = coordinator.db().get_parts(observer.id()).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|p| p.bytes_total).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert_eq!(parts[1].file_offset, 4);
        assert!(parts[2].is_last_part);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_paths() {
        let (coordinator, mut rx, dir) = setup().await;

        let err = coordinator
            .upload("bucket", "k", dir.path(), Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let err = coordinator
            .download("bucket", "k", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let err = coordinator
            .download("bucket", "k", dir.path().join("../escape.bin"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let err = coordinator
            .download("", "k", dir.path().join("out.bin"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        assert!(rx.try_recv().is_none());
        assert!(
            coordinator
                .get_transfers_with_type(TransferType::Download)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_pause_waiting_is_immediate() {
        let (coordinator, mut rx, dir) = setup().await;
        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();
        rx.try_recv();

        coordinator.pause(observer.id()).await.unwrap();
        assert_eq!(observer.refresh().await.unwrap(), TransferState::Paused);

        // resume keeps the record and re-signals
        let resumed = coordinator.resume(observer.id()).await.unwrap();
        assert_eq!(resumed.state(), TransferState::Waiting);
        assert_eq!(rx.try_recv(), Some(TransferCommand::Pause(observer.id())));
        assert_eq!(rx.try_recv(), Some(TransferCommand::Resume(observer.id())));
    }

    #[tokio::test]
    async fn test_pause_in_progress_only_signals() {
        let (coordinator, mut rx, dir) = setup().await;
        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();
        rx.try_recv();
        coordinator
            .db()
            .update_state(observer.id(), TransferState::InProgress)
            .await
            .unwrap();

        coordinator.pause(observer.id()).await.unwrap();
        assert_eq!(observer.refresh().await.unwrap(), TransferState::InProgress);
        assert_eq!(rx.try_recv(), Some(TransferCommand::Pause(observer.id())));
    }

    #[tokio::test]
    async fn test_commands_queue_in_store_without_worker() {
        let (coordinator, rx, dir) = setup().await;
        drop(rx);

        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();
        let id = observer.id();
        coordinator.db().update_state(id, TransferState::InProgress).await.unwrap();
        coordinator.pause(id).await.unwrap();
        coordinator.cancel(id).await.unwrap();

        assert_eq!(
            coordinator.db().take_queued_commands().await.unwrap(),
            vec![
                TransferCommand::Add(id),
                TransferCommand::Pause(id),
                TransferCommand::Cancel(id),
            ]
        );
        // the lease holder settles it, nothing is written here
        assert_eq!(observer.refresh().await.unwrap(), TransferState::InProgress);
    }

    #[tokio::test]
    async fn test_cancel_idle_is_idempotent() {
        let (coordinator, _rx, dir) = setup().await;
        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();

        coordinator.cancel(observer.id()).await.unwrap();
        coordinator.cancel(observer.id()).await.unwrap();
        assert_eq!(observer.refresh().await.unwrap(), TransferState::Canceled);
    }

    #[tokio::test]
    async fn test_resume_rules() {
        let (coordinator, _rx, dir) = setup().await;
        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();
        let id = observer.id();

        coordinator.db().set_bytes_total(id, 10).await.unwrap();
        coordinator.db().update_progress(id, 6, None).await.unwrap();
        coordinator
            .db()
            .update_state_with_error(id, TransferState::Failed, "boom")
            .await
            .unwrap();

        // FAILED keeps progress
        let resumed = coordinator.resume(id).await.unwrap();
        assert_eq!(resumed.state(), TransferState::Waiting);
        assert_eq!(resumed.bytes_current(), 6);
        assert!(resumed.error().is_none());

        // CANCELED restarts from zero
        coordinator.cancel(id).await.unwrap();
        let resumed = coordinator.resume(id).await.unwrap();
        assert_eq!(resumed.bytes_current(), 0);

        coordinator
            .db()
            .update_state(id, TransferState::Completed)
            .await
            .unwrap();
        let err = coordinator.resume(id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");

        let err = coordinator.resume(id + 100).await.unwrap_err();
        assert_eq!(err.code(), "RECORD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_state() {
        let (coordinator, _rx, dir) = setup().await;
        let observer = coordinator
            .download("bucket", "k", dir.path().join("out.bin"))
            .await
            .unwrap();
        let id = observer.id();
        coordinator
            .db()
            .update_state(id, TransferState::InProgress)
            .await
            .unwrap();

        let err = coordinator.delete_transfer_record(id).await.unwrap_err();
        assert_eq!(err.code(), "BUSY_CANNOT_DELETE");

        coordinator
            .db()
            .update_state(id, TransferState::Canceled)
            .await
            .unwrap();
        coordinator.delete_transfer_record(id).await.unwrap();

        let err = coordinator.get_transfer_by_id(id).await.unwrap_err();
        assert_eq!(err.code(), "RECORD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_bulk_operations_skip_parts() {
        let (coordinator, _rx, dir) = setup().await;
        let big = dir.path().join("big.bin");
        std::fs::write(&big, b"0123456789").unwrap();
        let small = dir.path().join("small.bin");
        std::fs::write(&small, b"ab").unwrap();

        coordinator
            .upload("bucket", "big", &big, Metadata::new())
            .await
            .unwrap();
        coordinator
            .upload("bucket", "small", &small, Metadata::new())
            .await
            .unwrap();

        assert_eq!(
            coordinator
                .pause_all_with_type(TransferType::Upload)
                .await
                .unwrap(),
            2
        );
        let paused = coordinator
            .get_transfers_with_type_and_state(TransferType::Upload, TransferState::Paused)
            .await
            .unwrap();
        assert_eq!(paused.len(), 2);

        assert_eq!(
            coordinator
                .cancel_all_with_type(TransferType::Upload)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            coordinator
                .pause_all_with_type(TransferType::Download)
                .await
                .unwrap(),
            0
        );
    }
}
