//! Transfer Core Types
//!
//! Row model of the transfer table and the request type accepted by the
//! coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::state::TransferState;

/// Store-assigned record id (SQLite rowid)
pub type TransferId = i64;

/// Opaque object metadata forwarded to the remote store
pub type Metadata = BTreeMap<String, String>;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TransferType {
    /// Local file -> remote object
    Upload = 1,
    /// Remote object -> local file
    Download = 2,
}

impl TransferType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TransferType::Upload),
            2 => Some(TransferType::Download),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Upload => "UPLOAD",
            TransferType::Download => "DOWNLOAD",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" | "up" => Ok(TransferType::Upload),
            "download" | "down" => Ok(TransferType::Download),
            other => Err(format!("unknown transfer type: {}", other)),
        }
    }
}

/// One row of the transfer table
///
/// A row is either a single transfer (`part_num == 0`, `!is_multipart`), a
/// multipart summary (`part_num == 0`, `is_multipart`), or a part
/// (`part_num > 0`, `main_upload_id` pointing at its summary).
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: TransferId,
    /// Summary id for parts, `None` otherwise
    pub main_upload_id: Option<TransferId>,
    pub transfer_type: TransferType,
    pub state: TransferState,
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    pub file_offset: u64,
    pub bytes_total: u64,
    pub bytes_current: u64,
    pub part_num: u32,
    pub is_last_part: bool,
    pub is_multipart: bool,
    /// Remote multipart upload id, shared by a summary and its parts
    pub multipart_id: Option<String>,
    pub etag: Option<String>,
    pub metadata: Metadata,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Part of a multipart upload
    #[inline]
    pub fn is_part(&self) -> bool {
        self.part_num > 0
    }

    /// Parent row of a multipart upload
    #[inline]
    pub fn is_summary(&self) -> bool {
        self.is_multipart && self.part_num == 0
    }

    /// Id of the record that owns this row's control flag
    #[inline]
    pub fn root_id(&self) -> TransferId {
        self.main_upload_id.unwrap_or(self.id)
    }

    /// Bytes still owed
    #[inline]
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_total.saturating_sub(self.bytes_current)
    }
}

/// Row payload for a new record; state starts at WAITING
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub transfer_type: TransferType,
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    pub file_offset: u64,
    pub bytes_total: u64,
    pub part_num: u32,
    pub is_last_part: bool,
    pub is_multipart: bool,
    pub metadata: Metadata,
}

impl NewTransfer {
    /// A single (non-multipart) transfer
    pub fn single(
        transfer_type: TransferType,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
        bytes_total: u64,
        metadata: Metadata,
    ) -> Self {
        Self {
            transfer_type,
            bucket: bucket.into(),
            key: key.into(),
            file_path: file_path.into(),
            file_offset: 0,
            bytes_total,
            part_num: 0,
            is_last_part: false,
            is_multipart: false,
            metadata,
        }
    }
}

/// Transfer request accepted by [`TransferCoordinator::start`]
///
/// [`TransferCoordinator::start`]: super::coordinator::TransferCoordinator::start
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub bucket: String,
    pub key: String,
    pub file_path: PathBuf,
    pub direction: TransferType,
    pub metadata: Metadata,
}

impl TransferRequest {
    pub fn upload(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            file_path: file_path.into(),
            direction: TransferType::Upload,
            metadata: Metadata::new(),
        }
    }

    pub fn download(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            file_path: file_path.into(),
            direction: TransferType::Download,
            metadata: Metadata::new(),
        }
    }

    /// Attach object metadata (uploads only)
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}
