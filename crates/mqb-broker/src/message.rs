use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Length of message and correlation identifiers.
pub const ID_LENGTH: usize = 24;

/// An all-zero identifier, meaning "not set".
pub const NO_ID: [u8; ID_LENGTH] = [0; ID_LENGTH];

/// Well-known 8 character message formats.
pub mod format {
    pub const NONE: &str = "        ";
    pub const STRING: &str = "MQSTR   ";
    pub const RF_HEADER: &str = "MQHRF   ";
    pub const RF_HEADER_2: &str = "MQHRF2  ";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    NotPersistent,
    Persistent,
    #[default]
    AsQueueDefault,
}

impl Persistence {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Persistence::NotPersistent),
            1 => Some(Persistence::Persistent),
            2 => Some(Persistence::AsQueueDefault),
            _ => None,
        }
    }
}

/// A broker message: descriptor fields, string properties and the data bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_id: [u8; ID_LENGTH],
    pub correlation_id: [u8; ID_LENGTH],
    pub format: String,
    pub reply_to_queue: String,
    pub reply_to_queue_manager: String,
    pub priority: i32,
    pub persistence: Persistence,
    /// Expiry in tenths of a second; -1 is unlimited.
    pub expiry: i32,
    pub application_id_data: String,
    pub put_time: Option<DateTime<Utc>>,
    pub backout_count: u32,
    pub properties: BTreeMap<String, String>,
    pub data: Bytes,
}

impl Default for BrokerMessage {
    fn default() -> Self {
        Self {
            message_id: NO_ID,
            correlation_id: NO_ID,
            format: format::NONE.to_string(),
            reply_to_queue: String::new(),
            reply_to_queue_manager: String::new(),
            priority: -1,
            persistence: Persistence::default(),
            expiry: -1,
            application_id_data: String::new(),
            put_time: None,
            backout_count: 0,
            properties: BTreeMap::new(),
            data: Bytes::new(),
        }
    }
}

impl BrokerMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn text(text: &str) -> Self {
        Self {
            format: format::STRING.to_string(),
            data: Bytes::copy_from_slice(text.as_bytes()),
            ..Default::default()
        }
    }

    pub fn total_length(&self) -> usize {
        self.data.len()
    }

    pub fn has_message_id(&self) -> bool {
        self.message_id != NO_ID
    }

    pub fn has_correlation_id(&self) -> bool {
        self.correlation_id != NO_ID
    }

    pub fn message_id_hex(&self) -> String {
        hex::encode(self.message_id)
    }

    pub fn correlation_id_hex(&self) -> String {
        hex::encode(self.correlation_id)
    }

    /// Reply-to queue, if one was set.
    pub fn reply_to(&self) -> Option<&str> {
        let name = self.reply_to_queue.trim();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// Pad or truncate a format name to the 8 character field width.
pub fn normalize_format(value: &str) -> String {
    let mut s: String = value.chars().take(8).collect();
    while s.len() < 8 {
        s.push(' ');
    }
    s
}

/// Generate a fresh identifier. Used by broker implementations on put.
pub fn generate_id() -> [u8; ID_LENGTH] {
    let mut id = NO_ID;
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    id[..16].copy_from_slice(a.as_bytes());
    id[16..].copy_from_slice(&b.as_bytes()[..8]);
    id
}

/// Parse a hex identifier, left-aligned and zero-padded to 24 bytes.
pub fn parse_id(value: &str) -> Option<[u8; ID_LENGTH]> {
    let bytes = hex::decode(value.trim()).ok()?;
    if bytes.len() > ID_LENGTH {
        return None;
    }
    let mut id = NO_ID;
    id[..bytes.len()].copy_from_slice(&bytes);
    Some(id)
}
