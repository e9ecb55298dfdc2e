//! Decoder for `FILE_NOTIFY_INFORMATION` batches.
//!
//! Each record is a 12 byte little-endian header (`NextEntryOffset`,
//! `Action`, `FileNameLength`) followed by `FileNameLength` bytes of UTF-16.
//! `NextEntryOffset` is relative to the start of the record; 0 ends the
//! chain.

use tracing::warn;

use crate::{FileSystemAction, FileSystemEvent, FsMonitorError};

pub(crate) const HEADER_LEN: usize = 12;

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn malformed(msg: String) -> FsMonitorError {
    FsMonitorError::MalformedBatch(msg)
}

/// Decodes one completed batch into events, preserving record order.
///
/// Records with an action code outside 1..=5 are skipped. Any record that
/// does not fit in `batch`, or a chain offset that would not make progress,
/// rejects the whole batch.
pub fn decode_notify_batch(batch: &[u8]) -> Result<Vec<FileSystemEvent>, FsMonitorError> {
    let mut events = Vec::new();
    let mut offset = 0usize;

    loop {
        let header = offset
            .checked_add(HEADER_LEN)
            .and_then(|end| batch.get(offset..end))
            .ok_or_else(|| malformed(format!("truncated record header at offset {offset}")))?;

        let next_entry = read_u32(header, 0) as usize;
        let action = read_u32(header, 4);
        let name_len = read_u32(header, 8) as usize;

        if name_len % 2 != 0 {
            return Err(malformed(format!(
                "odd file name length {name_len} at offset {offset}"
            )));
        }

        let name_start = offset + HEADER_LEN;
        let name = name_start
            .checked_add(name_len)
            .and_then(|end| batch.get(name_start..end))
            .ok_or_else(|| {
                malformed(format!(
                    "file name of {name_len} bytes at offset {offset} runs past the batch"
                ))
            })?;

        let units: Vec<u16> = name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        match FileSystemAction::from_code(action) {
            Some(action) => events.push(FileSystemEvent::new(
                action,
                String::from_utf16_lossy(&units),
            )),
            None => warn!(action, offset, "skipping record with unknown action code"),
        }

        if next_entry == 0 {
            break;
        }

        if next_entry < HEADER_LEN {
            return Err(malformed(format!(
                "next entry offset {next_entry} at offset {offset} overlaps its own header"
            )));
        }

        offset = offset
            .checked_add(next_entry)
            .ok_or_else(|| malformed(format!("next entry offset overflows at {offset}")))?;
    }

    Ok(events)
}
