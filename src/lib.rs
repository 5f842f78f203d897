//! object_transfer - Durable, Resumable Object Transfers
//!
//! Uploads and downloads between a local filesystem and an S3-style object
//! store that survive pauses, failures and process restarts.
//!
//! # Modules
//!
//! - [`transfer`] - Record store, coordinator, worker, observers
//! - [`transfer::remote`] - Remote store contract and the local backend
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use transfer::{
    LocalObjectStore, RemoteStore, TransferCoordinator, TransferDb, TransferError,
    TransferEvents, TransferObserver, TransferRequest, TransferState, TransferType,
    TransferWorker, WorkerConfig, WorkerLease, command_channel,
};
