//! Worker Command Channel
//!
//! Coordinator -> worker signals. Unbounded so a control call never blocks
//! the caller; delivery is at-least-once from the worker's point of view
//! (the periodic scan may rediscover a record that was also signalled), so
//! the worker re-checks record state before acting on any command.
//!
//! When no worker listens in this process the coordinator queues the
//! command in the record store instead (see `TransferDb::queue_command`),
//! keyed by the stable `code()` of each command.

use tokio::sync::mpsc;

use super::error::TransferError;
use super::types::TransferId;

/// Typed control signal for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferCommand {
    /// A new WAITING record exists
    Add(TransferId),
    /// Stop at the next checkpoint, keep progress
    Pause(TransferId),
    /// Record was moved back to WAITING
    Resume(TransferId),
    /// Stop at the next checkpoint and abort
    Cancel(TransferId),
}

impl TransferCommand {
    pub fn id(&self) -> TransferId {
        match self {
            TransferCommand::Add(id)
            | TransferCommand::Pause(id)
            | TransferCommand::Resume(id)
            | TransferCommand::Cancel(id) => *id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferCommand::Add(_) => "ADD",
            TransferCommand::Pause(_) => "PAUSE",
            TransferCommand::Resume(_) => "RESUME",
            TransferCommand::Cancel(_) => "CANCEL",
        }
    }

    /// Stored command code
    pub fn code(&self) -> i16 {
        match self {
            TransferCommand::Add(_) => 1,
            TransferCommand::Resume(_) => 2,
            TransferCommand::Pause(_) => 3,
            TransferCommand::Cancel(_) => 4,
        }
    }

    pub fn from_code(code: i16, id: TransferId) -> Option<Self> {
        match code {
            1 => Some(TransferCommand::Add(id)),
            2 => Some(TransferCommand::Resume(id)),
            3 => Some(TransferCommand::Pause(id)),
            4 => Some(TransferCommand::Cancel(id)),
            _ => None,
        }
    }
}

/// Sender side (held by the coordinator)
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<TransferCommand>,
}

impl CommandSender {
    /// Queue a command without waiting
    ///
    /// Fails only when the worker's receiver has been dropped.
    pub fn send(&self, command: TransferCommand) -> Result<(), TransferError> {
        self.tx.send(command).map_err(|_| {
            TransferError::ServiceUnavailable("transfer worker is not running".to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiver side (consumed by the worker's dispatch loop)
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<TransferCommand>,
}

impl CommandReceiver {
    /// Receive the next command; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<TransferCommand> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<TransferCommand> {
        self.rx.try_recv().ok()
    }
}

/// Create a new command channel pair
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, CommandReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (sender, mut receiver) = command_channel();

        sender.send(TransferCommand::Add(1)).unwrap();
        sender.send(TransferCommand::Pause(1)).unwrap();
        sender.send(TransferCommand::Cancel(2)).unwrap();

        assert_eq!(receiver.recv().await, Some(TransferCommand::Add(1)));
        assert_eq!(receiver.recv().await, Some(TransferCommand::Pause(1)));
        let cancel = receiver.try_recv().unwrap();
        assert_eq!(cancel.id(), 2);
        assert_eq!(cancel.as_str(), "CANCEL");
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_command_codes_roundtrip() {
        for command in [
            TransferCommand::Add(7),
            TransferCommand::Resume(7),
            TransferCommand::Pause(7),
            TransferCommand::Cancel(7),
        ] {
            assert_eq!(TransferCommand::from_code(command.code(), 7), Some(command));
        }
        assert_eq!(TransferCommand::from_code(0, 7), None);
    }

    #[tokio::test]
    async fn test_send_after_worker_gone() {
        let (sender, receiver) = command_channel();
        drop(receiver);

        assert!(sender.is_closed());
        let err = sender.send(TransferCommand::Add(1)).unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_dropped() {
        let (sender, mut receiver) = command_channel();
        let clone = sender.clone();
        drop(sender);
        clone.send(TransferCommand::Resume(9)).unwrap();
        drop(clone);

        assert_eq!(receiver.recv().await, Some(TransferCommand::Resume(9)));
        assert_eq!(receiver.recv().await, None);
    }
}
