//! Payloads carried through the replicated log

use serde_derive::{Deserialize, Serialize};

use crate::error::Result;

/// One replicated mutation of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalCommand {
    CreateSegment { name: String, index: u64 },
    RemoveSegment { name: String },
    Put { segment: u64, key: Vec<u8>, value: Vec<u8> },
    Delete { segment: u64, key: Vec<u8> },
}

impl JournalCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Membership record, carried as the context of a membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: u64,
    pub label: String,
    pub addr: String,
    /// false for observers
    pub voter: bool,
}

impl MemberInfo {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
