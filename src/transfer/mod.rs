//! Resumable Object Transfers
//!
//! Durable upload/download of local files to and from an S3-style object
//! store, with multipart uploads, pause/resume/cancel and crash recovery.
//!
//! # Architecture
//!
//! ```text
//! caller ──► TransferCoordinator ──► TransferDb (SQLite, authoritative)
//!                  │                        ▲
//!                  │ TransferCommand        │ state / progress
//!                  ▼                        │
//!            TransferWorker ───────► RemoteStore
//!                  │
//!                  ▼ TransferEvent (broadcast)
//!            TransferObserver ──► TransferListener
//! ```
//!
//! # State Machine
//!
//! ```text
//! WAITING → IN_PROGRESS → {PAUSED, CANCELED, COMPLETED, FAILED}
//!              ↓
//!       PART_COMPLETED (multipart summary only)
//!
//! PAUSED / FAILED → WAITING        (resume, progress kept)
//! CANCELED        → WAITING        (resume, restart from 0)
//! ```
//!
//! # Invariants
//!
//! 1. **Store first**: every transition is written before it is published
//! 2. **Worker-owned stops**: a running transfer reaches PAUSED/CANCELED only
//!    from the worker, at a chunk checkpoint
//! 3. **Monotonic progress**: `bytes_current` never decreases while a
//!    record is IN_PROGRESS and never exceeds `bytes_total`
//! 4. **One task per transfer**: a multipart group shares its summary's task
//! 5. **One worker per store**: only the `WorkerLease` holder executes
//!    transfers; other processes queue commands in the store

pub mod channel;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod lease;
pub mod observer;
pub mod planner;
pub mod remote;
pub mod state;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use channel::{CommandReceiver, CommandSender, TransferCommand, command_channel};
pub use coordinator::TransferCoordinator;
pub use db::{RecordFilter, TransferDb};
pub use error::TransferError;
pub use events::{TransferEvent, TransferEvents};
pub use lease::WorkerLease;
pub use observer::{TransferListener, TransferObserver};
pub use planner::{PartPlan, PartPlanConfig, PlannedPart, plan, plan_with};
pub use remote::{LocalObjectStore, RemoteError, RemoteStore};
pub use state::TransferState;
pub use types::{Metadata, NewTransfer, TransferId, TransferRecord, TransferRequest, TransferType};
pub use worker::{TransferWorker, WorkerConfig};
