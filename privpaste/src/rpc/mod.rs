//! Store RPC protocol between the webserver and the store process.
//!
//! Requests and responses travel on the control channel, one at a
//! time.  A response that hands over a file is followed by exactly one
//! [`MessageType::Descriptor`] message on the separate descriptor
//! channel, carrying the same sequence number and the file as
//! ancillary data.  Any deviation from this is a protocol violation
//! that ends the connection.

mod client;
mod server;

pub use client::{Created, StoreClient};
pub use server::StoreServer;

use derive_more::Display;
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Message types on the control and descriptor channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Create = 11,
    Fetch = 12,
    Delete = 13,
    Commit = 14,
    Abort = 15,
    Created = 32,
    Fetched = 33,
    Deleted = 34,
    Committed = 35,
    Aborted = 36,
    Failed = 37,
    Descriptor = 64,
}

impl MessageType {
    /// Returns true for message types that the webserver may send.
    pub fn is_request(self) -> bool {
        (self as u32) < (Self::Created as u32)
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for MessageType {
    type Error = u32;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Ok(match id {
            11 => Self::Create,
            12 => Self::Fetch,
            13 => Self::Delete,
            14 => Self::Commit,
            15 => Self::Abort,
            32 => Self::Created,
            33 => Self::Fetched,
            34 => Self::Deleted,
            35 => Self::Committed,
            36 => Self::Aborted,
            37 => Self::Failed,
            64 => Self::Descriptor,
            _ => return Err(id),
        })
    }
}

/// Requests from the webserver to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRequest {
    /// Allocate a new item and return a writable file.
    Create {
        size: u64,
        mime: String,
        lifetime: Duration,
    },
    /// Return metadata and a read-only file of a committed item.
    Fetch { id: String },
    /// Remove an item, authorized by its owner token.
    Delete { id: String, owner: String },
    /// Make a fully written item readable.
    Commit { id: String, owner: String },
    /// Discard an item that was not committed.
    Abort { id: String, owner: String },
}

impl StoreRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Create { .. } => MessageType::Create,
            Self::Fetch { .. } => MessageType::Fetch,
            Self::Delete { .. } => MessageType::Delete,
            Self::Commit { .. } => MessageType::Commit,
            Self::Abort { .. } => MessageType::Abort,
        }
    }

    /// Returns true if `response` is a valid answer to this request.
    pub fn accepts(&self, response: MessageType) -> bool {
        matches!(
            (self, response),
            (_, MessageType::Failed)
                | (Self::Create { .. }, MessageType::Created)
                | (Self::Fetch { .. }, MessageType::Fetched)
                | (Self::Delete { .. }, MessageType::Deleted)
                | (Self::Commit { .. }, MessageType::Committed)
                | (Self::Abort { .. }, MessageType::Aborted)
        )
    }
}

/// Public metadata of a committed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub mime: String,
    pub size: u64,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

/// Responses from the store to the webserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreResponse {
    /// The item was allocated; a writable file follows.
    Created {
        id: String,
        owner: String,
        expires_at: SystemTime,
    },
    /// The item exists; a read-only file follows.
    Fetched(ItemInfo),
    Deleted,
    /// The item was committed with its final size.
    Committed { size: u64 },
    Aborted,
    Failed(StoreError),
}

impl StoreResponse {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Created { .. } => MessageType::Created,
            Self::Fetched(_) => MessageType::Fetched,
            Self::Deleted => MessageType::Deleted,
            Self::Committed { .. } => MessageType::Committed,
            Self::Aborted => MessageType::Aborted,
            Self::Failed(_) => MessageType::Failed,
        }
    }

    /// Returns true if a descriptor follows this response.
    pub fn carries_descriptor(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Fetched(_))
    }
}

/// Per-request store errors; none of them affects the connection.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[display(fmt = "Item exceeds the maximum size")]
    SizeExceeded,
    #[display(fmt = "Invalid lifetime")]
    InvalidLifetime,
    #[display(fmt = "Too many items")]
    QuotaExceeded,
    #[display(fmt = "Item not found")]
    NotFound,
    #[display(fmt = "Invalid owner token")]
    Forbidden,
    #[display(fmt = "Internal store error")]
    Internal,
}
