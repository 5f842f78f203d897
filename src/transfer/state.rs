//! Transfer State Definitions
//!
//! State IDs are the values persisted in the `state` column of the
//! transfer table.

use std::fmt;
use std::str::FromStr;

/// Transfer lifecycle states
///
/// ```text
/// WAITING → IN_PROGRESS → { PAUSED, CANCELED, COMPLETED, FAILED }
///               │
///               └─ PART_COMPLETED (multipart summary only)
///
/// PAUSED / CANCELED / FAILED → WAITING   (resume)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TransferState {
    /// Recorded and queued for the worker
    Waiting = 0,

    /// Worker is moving bytes
    InProgress = 1,

    /// Stopped at a checkpoint; progress kept
    Paused = 2,

    /// Terminal: stopped on request, multipart upload aborted
    Canceled = 3,

    /// Terminal: all bytes transferred (and multipart finalized)
    Completed = 4,

    /// Remote or local I/O failed; resumable
    Failed = 5,

    /// Summary only: at least one part, but not all, completed
    PartCompleted = 6,
}

impl TransferState {
    /// Every state, in id order
    pub const ALL: [TransferState; 7] = [
        TransferState::Waiting,
        TransferState::InProgress,
        TransferState::Paused,
        TransferState::Canceled,
        TransferState::Completed,
        TransferState::Failed,
        TransferState::PartCompleted,
    ];

    /// Terminal for deletion purposes (COMPLETED, CANCELED)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Canceled)
    }

    /// The worker still owes this record work
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::Waiting | TransferState::InProgress | TransferState::PartCompleted
        )
    }

    /// `resume` moves these back to WAITING
    #[inline]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TransferState::Paused | TransferState::Canceled | TransferState::Failed
        )
    }

    /// Get the numeric state ID for storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a stored state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Waiting),
            1 => Some(TransferState::InProgress),
            2 => Some(TransferState::Paused),
            3 => Some(TransferState::Canceled),
            4 => Some(TransferState::Completed),
            5 => Some(TransferState::Failed),
            6 => Some(TransferState::PartCompleted),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Waiting => "WAITING",
            TransferState::InProgress => "IN_PROGRESS",
            TransferState::Paused => "PAUSED",
            TransferState::Canceled => "CANCELED",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
            TransferState::PartCompleted => "PART_COMPLETED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        TransferState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown transfer state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Canceled.is_terminal());

        assert!(!TransferState::Waiting.is_terminal());
        assert!(!TransferState::InProgress.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
        assert!(!TransferState::Failed.is_terminal());
        assert!(!TransferState::PartCompleted.is_terminal());
    }

    #[test]
    fn test_resumable_states() {
        assert!(TransferState::Paused.is_resumable());
        assert!(TransferState::Canceled.is_resumable());
        assert!(TransferState::Failed.is_resumable());

        assert!(!TransferState::Waiting.is_resumable());
        assert!(!TransferState::Completed.is_resumable());
        assert!(!TransferState::PartCompleted.is_resumable());
    }

    #[test]
    fn test_active_states() {
        assert!(TransferState::Waiting.is_active());
        assert!(TransferState::InProgress.is_active());
        assert!(TransferState::PartCompleted.is_active());
        assert!(!TransferState::Paused.is_active());
        assert!(!TransferState::Failed.is_active());
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in TransferState::ALL {
            let recovered = TransferState::from_id(state.id()).unwrap();
            assert_eq!(state, recovered);
        }
    }

    #[test]
    fn test_invalid_state_id() {
        assert!(TransferState::from_id(7).is_none());
        assert!(TransferState::from_id(-1).is_none());
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "part_completed".parse::<TransferState>().unwrap(),
            TransferState::PartCompleted
        );
        assert_eq!(
            "in-progress".parse::<TransferState>().unwrap(),
            TransferState::InProgress
        );
        assert!("running".parse::<TransferState>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferState::Waiting.to_string(), "WAITING");
        assert_eq!(TransferState::PartCompleted.to_string(), "PART_COMPLETED");
    }
}
