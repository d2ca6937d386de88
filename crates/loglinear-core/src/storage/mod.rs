//! Length-prefixed binary records.
//!
//! Each record is a little-endian `u64` byte length followed by the `bincode`
//! encoding of a serde record type (`ConcatVectorRecord`,
//! `GraphicalModelRecord`, ...). Several records may follow each other in one
//! stream; [`try_read_record`] distinguishes a clean end of stream from a
//! truncated record.
//!
//! I/O failures propagate unchanged. Nothing here retries.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::LoglinearError;

/// Upper bound on a single record's payload, to reject corrupt length prefixes
/// before allocating.
pub const MAX_RECORD_BYTES: u64 = 1 << 32;

/// Encodes a record without framing.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, LoglinearError> {
    bincode::serialize(record)
        .map_err(|e| LoglinearError::Serialization(format!("failed to encode record: {e}")))
}

/// Decodes an unframed record.
pub fn decode_record<T: DeserializeOwned>(data: &[u8]) -> Result<T, LoglinearError> {
    bincode::deserialize(data)
        .map_err(|e| LoglinearError::Serialization(format!("failed to decode record: {e}")))
}

/// Writes one framed record.
pub fn write_record<W: Write, T: Serialize>(
    writer: &mut W,
    record: &T,
) -> Result<(), LoglinearError> {
    let payload = encode_record(record)?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads one framed record. End of stream is an I/O error.
pub fn read_record<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, LoglinearError> {
    try_read_record(reader)?.ok_or_else(|| {
        LoglinearError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "no record before end of stream",
        ))
    })
}

/// Reads one framed record, or `None` at a clean end of stream.
pub fn try_read_record<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, LoglinearError> {
    let mut prefix = [0u8; 8];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(LoglinearError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "truncated record length prefix",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let len = u64::from_le_bytes(prefix);
    if len > MAX_RECORD_BYTES {
        return Err(LoglinearError::Serialization(format!(
            "record length {len} exceeds limit of {MAX_RECORD_BYTES} bytes"
        )));
    }
    // Grows with the bytes actually present, so a corrupt prefix on a short
    // stream cannot force a large allocation.
    let mut payload = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut payload)?;
    if (payload.len() as u64) < len {
        return Err(LoglinearError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("record truncated after {} of {len} bytes", payload.len()),
        )));
    }
    decode_record(&payload).map(Some)
}

/// Reads framed records until a clean end of stream.
pub fn read_all_records<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Vec<T>, LoglinearError> {
    let mut records = Vec::new();
    while let Some(record) = try_read_record(reader)? {
        records.push(record);
    }
    Ok(records)
}
