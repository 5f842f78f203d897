//! object-transfer - resumable uploads and downloads from the command line
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────┐    ┌─────────────┐
//! │   CLI    │───▶│ Coordinator │───▶│  SQLite  │◀───│   Worker    │
//! │ (clap)   │    │  (records)  │    │ (records)│    │ (local fs)  │
//! └──────────┘    └─────────────┘    └──────────┘    └─────────────┘
//! ```
//!
//! Foreground commands host the worker until their transfer stops; Ctrl-C
//! pauses it. `run` hosts the worker until Ctrl-C. Only the process holding
//! the worker lease executes transfers: any other invocation creates records
//! and queues commands in the store, then observes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use object_transfer::config::AppConfig;
use object_transfer::transfer::{
    CommandReceiver, LocalObjectStore, Metadata, TransferCoordinator, TransferDb, TransferError,
    TransferEvents, TransferId, TransferListener, TransferObserver, TransferRecord,
    TransferRequest, TransferState, TransferType, TransferWorker, WorkerLease, command_channel,
};

/// How long an observing process waits for the holder to honor Ctrl-C
const OBSERVED_PAUSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable, resumable object transfers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Environment; loads config/<env>.yaml
    #[arg(short, long, default_value = "dev")]
    env: String,

    /// Explicit config file (overrides --env)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        bucket: String,
        key: String,
        path: PathBuf,
        /// Object metadata as key=value (repeatable)
        #[arg(short, long = "meta", value_parser = parse_metadata)]
        metadata: Vec<(String, String)>,
        /// Only create the record; the lease holder picks it up
        #[arg(long)]
        detach: bool,
    },
    /// Download an object to a local file
    Download {
        bucket: String,
        key: String,
        path: PathBuf,
        #[arg(long)]
        detach: bool,
    },
    /// List transfers of one direction
    List {
        transfer_type: TransferType,
        #[arg(short, long)]
        state: Option<TransferState>,
    },
    /// Show one transfer (and its parts)
    Status { id: TransferId },
    /// Resume a paused, failed or canceled transfer
    Resume {
        id: TransferId,
        #[arg(long)]
        detach: bool,
    },
    /// Cancel a transfer
    Cancel { id: TransferId },
    /// Cancel and delete a transfer record
    Delete { id: TransferId },
    /// Host the worker until Ctrl-C
    Run,
}

fn parse_metadata(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

/// Logs progress of a foreground transfer
struct ProgressLogger;

impl TransferListener for ProgressLogger {
    fn on_state_changed(&self, id: TransferId, state: TransferState) {
        info!(transfer_id = id, state = %state, "State changed");
    }

    fn on_progress_changed(&self, id: TransferId, bytes_current: u64, bytes_total: u64) {
        let percent = if bytes_total == 0 {
            100.0
        } else {
            bytes_current as f64 * 100.0 / bytes_total as f64
        };
        info!(transfer_id = id, bytes_current, bytes_total, "{:.1}%", percent);
    }

    fn on_error(&self, id: TransferId, message: &str) {
        warn!(transfer_id = id, error = message, "Transfer error");
    }
}

/// Everything a command needs
struct App {
    coordinator: TransferCoordinator,
    worker: TransferWorker,
    /// `None` once commands go through the store to another process
    commands: Option<CommandReceiver>,
    lease_ttl: Duration,
}

impl App {
    async fn open(config: &AppConfig) -> Result<Self> {
        if let Some(parent) = sqlite_parent_dir(&config.database.url) {
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = TransferDb::connect(&config.database.url, config.database.max_connections)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;

        let remote_root = config.remote_root();
        std::fs::create_dir_all(&remote_root)
            .with_context(|| format!("Failed to create {}", remote_root.display()))?;
        let remote = Arc::new(
            LocalObjectStore::new(remote_root).with_read_chunk_size(config.transfer.chunk_size),
        );

        let events = TransferEvents::new(config.transfer.event_capacity);
        let (tx, rx) = command_channel();
        let worker = TransferWorker::new(
            db.clone(),
            remote,
            events.clone(),
            config.transfer.worker_config(),
        );
        let coordinator =
            TransferCoordinator::new(db, tx, events, config.transfer.part_plan_config());

        Ok(Self {
            coordinator,
            worker,
            commands: Some(rx),
            lease_ttl: config.transfer.lease_ttl(),
        })
    }

    /// Take the worker lease; without it this process only records and observes
    async fn claim(&mut self) -> Result<Option<WorkerLease>> {
        let db = self.coordinator.db().clone();
        if let Some(lease) = WorkerLease::acquire(db.clone(), self.lease_ttl).await? {
            return Ok(Some(lease));
        }
        self.detach();
        let holder = WorkerLease::current_holder(&db).await?.unwrap_or_default();
        info!(holder = %holder, "Worker runs in another process, commands go through the store");
        Ok(None)
    }

    /// Queue every later command in the store for the lease holder
    fn detach(&mut self) {
        self.commands = None;
    }

    /// Apply channel commands as the lease holder, without starting the loop
    async fn apply_queued(&mut self, lease: &WorkerLease) -> Result<()> {
        let Some(commands) = self.commands.as_mut() else {
            return Ok(());
        };
        while let Some(command) = commands.try_recv() {
            self.worker.apply(lease, command).await?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(&cli.env)?,
    };
    let _log_guard = object_transfer::logging::init_logging(&config)?;
    info!(env = %cli.env, "Starting object-transfer");

    let mut app = App::open(&config).await?;

    match cli.command {
        Command::Upload {
            bucket,
            key,
            path,
            metadata,
            detach,
        } => {
            let metadata: Metadata = metadata.into_iter().collect();
            let req = TransferRequest::upload(bucket, key, path).with_metadata(metadata);
            let lease = host_unless(&mut app, detach).await?;
            let observer = app.coordinator.start(req).await?;
            println!("transfer {} created", observer.id());
            if !detach {
                follow(app, lease, observer).await?;
            }
        }
        Command::Download {
            bucket,
            key,
            path,
            detach,
        } => {
            let lease = host_unless(&mut app, detach).await?;
            let observer = app
                .coordinator
                .start(TransferRequest::download(bucket, key, path))
                .await?;
            println!("transfer {} created", observer.id());
            if !detach {
                follow(app, lease, observer).await?;
            }
        }
        Command::List {
            transfer_type,
            state,
        } => {
            let observers = match state {
                Some(state) => {
                    app.coordinator
                        .get_transfers_with_type_and_state(transfer_type, state)
                        .await?
                }
                None => app.coordinator.get_transfers_with_type(transfer_type).await?,
            };
            for observer in &observers {
                print_observer(observer);
            }
            println!("{} transfer(s)", observers.len());
        }
        Command::Status { id } => {
            let record = app
                .coordinator
                .db()
                .get(id)
                .await?
                .ok_or(TransferError::TransferNotFound(id))?;
            print_record(&record);
            if record.is_summary() {
                for part in app.coordinator.db().get_parts(id).await? {
                    print!("  ");
                    print_record(&part);
                }
            }
        }
        Command::Resume { id, detach } => {
            let lease = host_unless(&mut app, detach).await?;
            let observer = app.coordinator.resume(id).await?;
            println!("transfer {} is {}", observer.id(), observer.state());
            if !detach {
                follow(app, lease, observer).await?;
            }
        }
        Command::Cancel { id } => {
            let lease = app.claim().await?;
            app.coordinator.cancel(id).await?;
            if let Some(lease) = lease {
                let applied = app.apply_queued(&lease).await;
                lease.release().await;
                applied?;
            }
            let observer = app.coordinator.get_transfer_by_id(id).await?;
            println!("transfer {} is {}", observer.id(), observer.state());
        }
        Command::Delete { id } => {
            let lease = app.claim().await?;
            let result = match (app.coordinator.delete_transfer_record(id).await, &lease) {
                (Err(TransferError::BusyCannotDelete(_)), Some(lease)) => {
                    // the cancel may only need the queued command applied
                    match app.apply_queued(lease).await {
                        Ok(()) => app.coordinator.delete_transfer_record(id).await,
                        Err(e) => Err(TransferError::ServiceUnavailable(e.to_string())),
                    }
                }
                (other, _) => other,
            };
            if let Some(lease) = lease {
                lease.release().await;
            }
            match result {
                Ok(()) => println!("transfer {} deleted", id),
                Err(TransferError::BusyCannotDelete(_)) => {
                    bail!("transfer {} is still running; retry once it is CANCELED", id)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Run => {
            let Some(lease) = app.claim().await? else {
                bail!("another process already runs the transfer worker");
            };
            run(app, lease).await?
        }
    }

    Ok(())
}

/// Claim the lease for a foreground command; detached ones only record
async fn host_unless(app: &mut App, detach: bool) -> Result<Option<WorkerLease>> {
    if detach {
        app.detach();
        return Ok(None);
    }
    app.claim().await
}

async fn follow(app: App, lease: Option<WorkerLease>, observer: TransferObserver) -> Result<()> {
    match lease {
        Some(lease) => foreground(app, lease, observer).await,
        None => observe(app, observer).await,
    }
}

/// Host the worker until the observed transfer stops; Ctrl-C pauses it
async fn foreground(app: App, lease: WorkerLease, mut observer: TransferObserver) -> Result<()> {
    let App {
        coordinator,
        worker,
        commands,
        ..
    } = app;
    let Some(commands) = commands else {
        bail!("command channel was handed off");
    };
    let handle = tokio::spawn(worker.clone().run(lease, commands));
    observer.set_listener(Arc::new(ProgressLogger));

    let stopped = |state: TransferState| !state.is_active();
    let state = tokio::select! {
        state = observer.wait_until(stopped) => state?,
        _ = tokio::signal::ctrl_c() => {
            info!(transfer_id = observer.id(), "Ctrl-C received, pausing");
            coordinator.pause(observer.id()).await?;
            observer.wait_until(stopped).await?
        }
    };

    worker.shutdown().await;
    drop(coordinator);
    handle.await.context("worker task panicked")?;
    report(&observer, state)
}

/// Follow a transfer another process executes; Ctrl-C asks it to pause
async fn observe(app: App, observer: TransferObserver) -> Result<()> {
    println!("transfer {} runs in the worker of another process", observer.id());
    let stopped = |state: TransferState| !state.is_active();
    let state = tokio::select! {
        state = observer.wait_until(stopped) => state?,
        _ = tokio::signal::ctrl_c() => {
            info!(transfer_id = observer.id(), "Ctrl-C received, asking the worker to pause");
            app.coordinator.pause(observer.id()).await?;
            match tokio::time::timeout(OBSERVED_PAUSE_TIMEOUT, observer.wait_until(stopped)).await {
                Ok(state) => state?,
                Err(_) => {
                    println!("transfer {}: pause queued for the worker", observer.id());
                    return Ok(());
                }
            }
        }
    };
    observer.refresh().await?;
    report(&observer, state)
}

fn report(observer: &TransferObserver, state: TransferState) -> Result<()> {
    println!("transfer {} is {}", observer.id(), state);
    if state == TransferState::Failed {
        let reason = observer.error().unwrap_or_default();
        bail!("transfer {} failed: {}", observer.id(), reason);
    }
    Ok(())
}

/// Host the worker with its periodic scan until Ctrl-C
async fn run(app: App, lease: WorkerLease) -> Result<()> {
    let App {
        coordinator,
        worker,
        commands,
        ..
    } = app;
    let Some(commands) = commands else {
        bail!("command channel was handed off");
    };
    let handle = tokio::spawn(worker.clone().run(lease, commands));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, pausing running transfers");

    worker.shutdown().await;
    drop(coordinator);
    handle.await.context("worker task panicked")?;
    Ok(())
}

/// Parent directory of a file-backed sqlite url
fn sqlite_parent_dir(url: &str) -> Option<PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(':') {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn print_observer(observer: &TransferObserver) {
    println!(
        "{:>6}  {:<8}  {:<14}  {:>12}/{:<12}  {}/{}  {}",
        observer.id(),
        observer.transfer_type().as_str(),
        observer.state().as_str(),
        observer.bytes_current(),
        observer.bytes_total(),
        observer.bucket(),
        observer.key(),
        observer.file_path().display()
    );
}

fn print_record(record: &TransferRecord) {
    let kind = if record.is_part() {
        format!("part {}", record.part_num)
    } else if record.is_multipart {
        "multipart".to_string()
    } else {
        "single".to_string()
    };
    println!(
        "{:>6}  {:<10}  {:<14}  {:>12}/{:<12}  {}/{}  {}{}",
        record.id,
        kind,
        record.state.as_str(),
        record.bytes_current,
        record.bytes_total,
        record.bucket,
        record.key,
        record.file_path.display(),
        record
            .error
            .as_deref()
            .map(|e| format!("  error: {}", e))
            .unwrap_or_default()
    );
}
