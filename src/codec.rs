// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire codec for [`ReplicationEntry`].
//!
//! Each entry is one self-describing JSON document with named fields; a
//! batch is a sequence of documents separated by `\n`.
//!
//! ```text
//! {"key":"6b31","value":"7631","timestamp":42,"identifier":1,
//!  "isDeleted":false,"bootStrapTimeStamp":0,"remoteIdentifier":2}
//! ```
//!
//! | Field | Type | Notes |
//! |-------|------|-------|
//! | `key` | hex bytes | never compressed |
//! | `value` | hex bytes, absent for deletions | compressed when enabled |
//! | `timestamp` | int64 | logical write time |
//! | `identifier` | int8 | originating node |
//! | `isDeleted` | bool | must agree with presence of `value` |
//! | `bootStrapTimeStamp` | int64 | backfill pass start, 0 for live |
//! | `valueCompression` | string, optional | scheme used for `value` |
//! | `remoteIdentifier` | int8, optional | routing annotation, ignored by decoding |
//!
//! # Value Compression
//!
//! The scheme is a process-wide setting ([`set_value_compression`], usually
//! installed from [`CodecConfig`](crate::config::CodecConfig)). The decoder
//! does not depend on it: the scheme travels with each record.
//!
//! # Skipping Bad Records
//!
//! [`EntryDecoder`] yields one `Result` per record. A structurally incomplete
//! record is a recoverable [`ReplicationError::Decode`]; the decoder has
//! already advanced past it, so callers log and continue.

use crate::entry::ReplicationEntry;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::RwLock;
use tracing::warn;

/// zstd magic bytes, used to sanity-check zstd payloads before decoding.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Largest decompressed value accepted from the wire.
const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// Record separator inside a batch.
pub const RECORD_SEPARATOR: u8 = b'\n';

static VALUE_COMPRESSION: RwLock<Compression> = RwLock::new(Compression::None);
static ZSTD_LEVEL: AtomicI32 = AtomicI32::new(3);

/// Value compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Lz4,
}

impl FromStr for Compression {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            "lz4" => Ok(Compression::Lz4),
            other => Err(ReplicationError::Config(format!(
                "Unknown value compression scheme: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Compression {
    /// Wire name of the scheme.
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Compress a value payload.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::encode_all(data, ZSTD_LEVEL.load(Ordering::Relaxed))
                .map_err(|e| ReplicationError::Internal(format!("zstd encode: {}", e))),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Decompress a value payload.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => {
                if data.len() < 4 || data[..4] != ZSTD_MAGIC {
                    return Err(ReplicationError::Decompression(
                        "zstd payload missing magic header".to_string(),
                    ));
                }
                let mut decoder = zstd::Decoder::new(data)
                    .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
                let mut decompressed = Vec::new();
                decoder
                    .take(MAX_DECOMPRESSED_LEN as u64 + 1)
                    .read_to_end(&mut decompressed)
                    .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
                if decompressed.len() > MAX_DECOMPRESSED_LEN {
                    return Err(ReplicationError::Decompression(format!(
                        "zstd payload expands past {} bytes",
                        MAX_DECOMPRESSED_LEN
                    )));
                }
                Ok(decompressed)
            }
            Compression::Lz4 => {
                let declared = data
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .ok_or_else(|| ReplicationError::Decompression("lz4 payload missing size prefix".to_string()))?;
                if declared > MAX_DECOMPRESSED_LEN {
                    return Err(ReplicationError::Decompression(format!(
                        "lz4 payload declares {} bytes, limit is {}",
                        declared, MAX_DECOMPRESSED_LEN
                    )));
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| ReplicationError::Decompression(format!("lz4 decode: {}", e)))
            }
        }
    }
}

/// Set the process-wide value compression used by [`encode_entry`].
pub fn set_value_compression(compression: Compression) {
    let mut slot = VALUE_COMPRESSION.write().unwrap_or_else(|e| e.into_inner());
    *slot = compression;
}

/// The process-wide value compression.
pub fn value_compression() -> Compression {
    *VALUE_COMPRESSION.read().unwrap_or_else(|e| e.into_inner())
}

/// Set the zstd level used when the scheme is zstd.
pub fn set_zstd_level(level: i32) {
    ZSTD_LEVEL.store(level, Ordering::Relaxed);
}

/// On-the-wire shape of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    timestamp: i64,
    identifier: u8,
    #[serde(rename = "isDeleted")]
    is_deleted: bool,
    #[serde(rename = "bootStrapTimeStamp")]
    bootstrap_timestamp: i64,
    #[serde(rename = "valueCompression", default, skip_serializing_if = "Option::is_none")]
    value_compression: Option<String>,
    #[serde(rename = "remoteIdentifier", default, skip_serializing_if = "Option::is_none")]
    remote_identifier: Option<u8>,
}

/// Encode one entry using the process-wide value compression.
pub fn encode_entry(entry: &ReplicationEntry) -> Result<Vec<u8>> {
    encode_entry_with(entry, value_compression())
}

/// Encode one entry with an explicit value compression.
pub fn encode_entry_with(entry: &ReplicationEntry, compression: Compression) -> Result<Vec<u8>> {
    let value = match entry.value() {
        Some(raw) => Some(hex::encode(compression.compress(raw)?)),
        None => None,
    };
    let wire = WireEntry {
        key: hex::encode(entry.key()),
        value_compression: match (&value, compression) {
            (Some(_), c) if c.is_enabled() => Some(c.name().to_string()),
            _ => None,
        },
        value,
        timestamp: entry.timestamp(),
        identifier: entry.identifier(),
        is_deleted: entry.is_deleted(),
        bootstrap_timestamp: entry.bootstrap_timestamp(),
        remote_identifier: entry.remote_identifier(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode one record into a sealed entry.
pub fn decode_entry(record: &[u8]) -> Result<ReplicationEntry> {
    let wire: WireEntry = serde_json::from_slice(record)?;

    let key = hex::decode(&wire.key)
        .map_err(|e| ReplicationError::Decode(format!("key is not hex: {}", e)))?;

    let entry = match (wire.is_deleted, wire.value) {
        (true, None) => ReplicationEntry::delete(key, wire.timestamp, wire.identifier),
        (false, Some(encoded)) => {
            let bytes = hex::decode(&encoded)
                .map_err(|e| ReplicationError::Decode(format!("value is not hex: {}", e)))?;
            let compression = match wire.value_compression.as_deref() {
                Some(name) => Compression::from_str(name)
                    .map_err(|_| ReplicationError::Decode(format!("unknown valueCompression: {}", name)))?,
                None => Compression::None,
            };
            let value = compression.decompress(&bytes)?;
            ReplicationEntry::put(key, value, wire.timestamp, wire.identifier)
        }
        (false, None) => {
            return Err(ReplicationError::Decode(
                "record is not deleted but carries no value".to_string(),
            ))
        }
        (true, Some(_)) => {
            return Err(ReplicationError::Decode(
                "record is deleted but carries a value".to_string(),
            ))
        }
    };

    let entry = match wire.remote_identifier {
        Some(id) => entry.with_remote_identifier(id),
        None => entry,
    };
    Ok(entry.with_bootstrap_timestamp(wire.bootstrap_timestamp).into_read_only())
}

/// Encode a batch of entries as separator-delimited records.
pub fn encode_batch<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a ReplicationEntry>,
{
    let compression = value_compression();
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&encode_entry_with(entry, compression)?);
        out.push(RECORD_SEPARATOR);
    }
    Ok(out)
}

/// Iterator over the records of a batch; one `Result` per non-empty record.
pub struct EntryDecoder<'a> {
    remaining: &'a [u8],
    position: usize,
}

impl<'a> EntryDecoder<'a> {
    pub fn new(batch: &'a [u8]) -> Self {
        Self {
            remaining: batch,
            position: 0,
        }
    }

    /// Byte offset of the next unread record.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<'a> Iterator for EntryDecoder<'a> {
    type Item = Result<ReplicationEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining.is_empty() {
                return None;
            }
            let (record, consumed) = match self.remaining.iter().position(|b| *b == RECORD_SEPARATOR) {
                Some(idx) => (&self.remaining[..idx], idx + 1),
                None => (self.remaining, self.remaining.len()),
            };
            self.remaining = &self.remaining[consumed..];
            self.position += consumed;

            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(decode_entry(record));
        }
    }
}

/// Decode a whole batch, skipping records that fail to decode.
///
/// Returns the decoded entries and the number of skipped records.
pub fn decode_batch(batch: &[u8]) -> (Vec<ReplicationEntry>, usize) {
    let mut decoder = EntryDecoder::new(batch);
    let mut entries = Vec::new();
    let mut skipped = 0;

    while let Some(result) = decoder.next() {
        match result {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                skipped += 1;
                metrics::record_decode_failure(decode_failure_reason(&e));
                warn!(
                    position = decoder.position(),
                    error = %e,
                    "Failed to decode replication entry, skipping"
                );
            }
        }
    }

    (entries, skipped)
}

fn decode_failure_reason(e: &ReplicationError) -> &'static str {
    match e {
        ReplicationError::Decompression(_) => "decompression",
        _ => "malformed",
    }
}
