//! Message framing helpers.
//!
//! Messages whose format names an RFH or RFH2 header carry that header in
//! front of the payload. These helpers split the two apart on receive,
//! merge them back on send, and map configured overrides onto message
//! descriptor fields and properties.
//!
//! Header integers are big-endian.

use crate::message::{format, normalize_format, parse_id, BrokerMessage, Persistence};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;

const STRUC_ID: &[u8; 4] = b"RFH ";
const RFH1_FIXED_LEN: usize = 32;
const RFH2_FIXED_LEN: usize = 36;

/// Native encoding and UTF-8, the values a fresh header is built with.
pub const DEFAULT_ENCODING: i32 = 273;
pub const DEFAULT_CCSID: i32 = 1208;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid header struct id {0:?}")]
    BadStructId(String),

    #[error("Invalid header length {0}")]
    BadLength(i32),

    #[error("Header version {version} does not match format {format:?}")]
    VersionMismatch { version: i32, format: String },

    #[error("Unknown override field '{0}'")]
    UnknownField(String),

    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: String, value: String },
}

/// A message body split into its optional header and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPayload {
    pub header: Option<Bytes>,
    pub payload: Bytes,
}

/// Whether a message format announces a leading RFH/RFH2 header.
pub fn is_header_format(value: &str) -> bool {
    value == format::RF_HEADER || value == format::RF_HEADER_2
}

/// Split the header (if the format announces one) from the payload.
pub fn split_header_payload(message: &BrokerMessage) -> Result<HeaderPayload, FramingError> {
    if !is_header_format(&message.format) {
        return Ok(HeaderPayload {
            header: None,
            payload: message.data.clone(),
        });
    }

    let (version, length) = read_fixed(&message.data)?;
    let expected = if message.format == format::RF_HEADER_2 { 2 } else { 1 };
    if version != expected {
        return Err(FramingError::VersionMismatch {
            version,
            format: message.format.clone(),
        });
    }

    Ok(HeaderPayload {
        header: Some(message.data.slice(..length)),
        payload: message.data.slice(length..),
    })
}

/// Write `header ++ payload` into the message, setting its format to match.
pub fn merge_header_payload(
    message: &mut BrokerMessage,
    header: Option<&[u8]>,
    payload: &[u8],
) -> Result<(), FramingError> {
    match header {
        Some(header) => {
            let (version, length) = read_fixed(header)?;
            if length != header.len() {
                return Err(FramingError::BadLength(length as i32));
            }
            let mut data = BytesMut::with_capacity(header.len() + payload.len());
            data.put_slice(header);
            data.put_slice(payload);
            message.data = data.freeze();
            message.format = if version == 2 {
                format::RF_HEADER_2.to_string()
            } else {
                format::RF_HEADER.to_string()
            };
        }
        None => {
            message.data = Bytes::copy_from_slice(payload);
            if is_header_format(&message.format) {
                message.format = format::NONE.to_string();
            }
        }
    }
    Ok(())
}

/// Validate the fixed part of a header and return (version, struct length).
fn read_fixed(data: &[u8]) -> Result<(i32, usize), FramingError> {
    if data.len() < 12 {
        return Err(FramingError::Truncated {
            needed: 12,
            available: data.len(),
        });
    }
    if &data[..4] != STRUC_ID {
        return Err(FramingError::BadStructId(
            String::from_utf8_lossy(&data[..4]).into_owned(),
        ));
    }
    let version = read_i32(data, 4);
    let length = read_i32(data, 8);
    let minimum = match version {
        1 => RFH1_FIXED_LEN,
        2 => RFH2_FIXED_LEN,
        _ => return Err(FramingError::BadLength(length)),
    };
    if length < 0 || (length as usize) < minimum {
        return Err(FramingError::BadLength(length));
    }
    if length as usize > data.len() {
        return Err(FramingError::Truncated {
            needed: length as usize,
            available: data.len(),
        });
    }
    Ok((version, length as usize))
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    i32::from_be_bytes(buf)
}

// ============================================================================
// RFH2 header
// ============================================================================

/// An RFH2 header with its name/value folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfh2Header {
    pub encoding: i32,
    pub ccsid: i32,
    /// Format of the payload that follows the header.
    pub format: String,
    pub flags: i32,
    pub name_value_ccsid: i32,
    pub folders: Vec<String>,
}

impl Default for Rfh2Header {
    fn default() -> Self {
        Self {
            encoding: DEFAULT_ENCODING,
            ccsid: DEFAULT_CCSID,
            format: format::STRING.to_string(),
            flags: 0,
            name_value_ccsid: DEFAULT_CCSID,
            folders: Vec::new(),
        }
    }
}

impl Rfh2Header {
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folders.push(folder.into());
        self
    }

    /// Encode the header. Folders are space padded to a multiple of four.
    pub fn encode(&self) -> Bytes {
        let padded: Vec<Vec<u8>> = self
            .folders
            .iter()
            .map(|f| {
                let mut bytes = f.as_bytes().to_vec();
                while bytes.len() % 4 != 0 {
                    bytes.push(b' ');
                }
                bytes
            })
            .collect();
        let length = RFH2_FIXED_LEN + padded.iter().map(|f| 4 + f.len()).sum::<usize>();

        let mut buf = BytesMut::with_capacity(length);
        buf.put_slice(STRUC_ID);
        buf.put_i32(2);
        buf.put_i32(length as i32);
        buf.put_i32(self.encoding);
        buf.put_i32(self.ccsid);
        buf.put_slice(normalize_format(&self.format).as_bytes());
        buf.put_i32(self.flags);
        buf.put_i32(self.name_value_ccsid);
        for folder in &padded {
            buf.put_i32(folder.len() as i32);
            buf.put_slice(folder);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, FramingError> {
        let (version, length) = read_fixed(data)?;
        if version != 2 {
            return Err(FramingError::VersionMismatch {
                version,
                format: format::RF_HEADER_2.to_string(),
            });
        }

        let mut folders = Vec::new();
        let mut offset = RFH2_FIXED_LEN;
        while offset < length {
            if offset + 4 > length {
                return Err(FramingError::Truncated {
                    needed: offset + 4,
                    available: length,
                });
            }
            let folder_len = read_i32(data, offset);
            if folder_len < 0 || offset + 4 + folder_len as usize > length {
                return Err(FramingError::BadLength(folder_len));
            }
            let start = offset + 4;
            let end = start + folder_len as usize;
            folders.push(String::from_utf8_lossy(&data[start..end]).trim_end().to_string());
            offset = end;
        }

        Ok(Self {
            encoding: read_i32(data, 12),
            ccsid: read_i32(data, 16),
            format: String::from_utf8_lossy(&data[20..28]).into_owned(),
            flags: read_i32(data, 28),
            name_value_ccsid: read_i32(data, 32),
            folders,
        })
    }
}

// ============================================================================
// Overrides
// ============================================================================

/// Apply configured overrides.
///
/// `mqmd.<field>` keys set descriptor fields, `property.<name>` keys set
/// message properties. Anything else is rejected.
pub fn apply_overrides(
    message: &mut BrokerMessage,
    overrides: &BTreeMap<String, String>,
) -> Result<(), FramingError> {
    for (key, value) in overrides {
        if let Some(field) = key.strip_prefix("mqmd.") {
            apply_descriptor_field(message, field, value)?;
        } else if let Some(name) = key.strip_prefix("property.") {
            if name.is_empty() {
                return Err(FramingError::UnknownField(key.clone()));
            }
            message.properties.insert(name.to_string(), value.clone());
        } else {
            return Err(FramingError::UnknownField(key.clone()));
        }
    }
    Ok(())
}

fn apply_descriptor_field(
    message: &mut BrokerMessage,
    field: &str,
    value: &str,
) -> Result<(), FramingError> {
    let invalid = || FramingError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    };

    match field {
        "priority" => {
            let priority: i32 = value.trim().parse().map_err(|_| invalid())?;
            if !(0..=9).contains(&priority) {
                return Err(invalid());
            }
            message.priority = priority;
        }
        "persistence" => {
            let code: i32 = value.trim().parse().map_err(|_| invalid())?;
            message.persistence = Persistence::from_code(code).ok_or_else(invalid)?;
        }
        "expiry" => {
            let expiry: i32 = value.trim().parse().map_err(|_| invalid())?;
            if expiry < -1 || expiry == 0 {
                return Err(invalid());
            }
            message.expiry = expiry;
        }
        "format" => message.format = normalize_format(value),
        "correlationId" => message.correlation_id = parse_id(value).ok_or_else(invalid)?,
        "replyToQueueManagerName" => message.reply_to_queue_manager = value.to_string(),
        "applicationIdData" => message.application_id_data = value.to_string(),
        _ => return Err(FramingError::UnknownField(format!("mqmd.{}", field))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Bytes {
        Rfh2Header::default()
            .with_folder("<mcd><Msd>jms_text</Msd></mcd>")
            .with_folder("<usr><orderId>42</orderId></usr>")
            .encode()
    }

    #[test]
    fn test_merge_then_split_is_identity() {
        let header = sample_header();
        let payload = b"<order id=\"42\"/>".to_vec();

        let mut message = BrokerMessage::default();
        merge_header_payload(&mut message, Some(&header), &payload).unwrap();
        assert_eq!(message.format, format::RF_HEADER_2);

        let split = split_header_payload(&message).unwrap();
        assert_eq!(split.header.as_deref(), Some(&header[..]));
        assert_eq!(&split.payload[..], &payload[..]);
    }

    #[test]
    fn test_split_without_header_format() {
        let message = BrokerMessage::text("plain");
        let split = split_header_payload(&message).unwrap();
        assert!(split.header.is_none());
        assert_eq!(&split.payload[..], b"plain");
    }

    #[test]
    fn test_merge_without_header_clears_header_format() {
        let mut message = BrokerMessage::default();
        message.format = format::RF_HEADER_2.to_string();
        merge_header_payload(&mut message, None, b"body").unwrap();
        assert_eq!(message.format, format::NONE);
        assert_eq!(&message.data[..], b"body");
    }

    #[test]
    fn test_split_rejects_malformed_header() {
        let mut message = BrokerMessage::new(Bytes::from_static(b"NOPE0000000000000000"));
        message.format = format::RF_HEADER_2.to_string();
        assert!(matches!(
            split_header_payload(&message),
            Err(FramingError::BadStructId(_))
        ));

        let mut header = sample_header().to_vec();
        header.truncate(20);
        message.data = Bytes::from(header);
        assert!(matches!(
            split_header_payload(&message),
            Err(FramingError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rfh2_decode_reads_folders() {
        let decoded = Rfh2Header::decode(&sample_header()).unwrap();
        assert_eq!(decoded.format, format::STRING);
        assert_eq!(decoded.folders.len(), 2);
        assert_eq!(decoded.folders[1], "<usr><orderId>42</orderId></usr>");
    }

    #[test]
    fn test_apply_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("mqmd.priority".to_string(), "7".to_string());
        overrides.insert("mqmd.persistence".to_string(), "1".to_string());
        overrides.insert("mqmd.correlationId".to_string(), "abcd".to_string());
        overrides.insert("property.region".to_string(), "emea".to_string());

        let mut message = BrokerMessage::text("x");
        apply_overrides(&mut message, &overrides).unwrap();
        assert_eq!(message.priority, 7);
        assert_eq!(message.persistence, Persistence::Persistent);
        assert_eq!(&message.correlation_id[..2], &[0xab, 0xcd]);
        assert_eq!(message.properties.get("region").map(String::as_str), Some("emea"));
    }

    #[test]
    fn test_apply_overrides_rejects_bad_input() {
        let mut message = BrokerMessage::text("x");

        let mut overrides = BTreeMap::new();
        overrides.insert("mqmd.priority".to_string(), "12".to_string());
        assert!(matches!(
            apply_overrides(&mut message, &overrides),
            Err(FramingError::InvalidValue { .. })
        ));

        let mut overrides = BTreeMap::new();
        overrides.insert("header.foo".to_string(), "x".to_string());
        assert!(matches!(
            apply_overrides(&mut message, &overrides),
            Err(FramingError::UnknownField(_))
        ));
    }
}
