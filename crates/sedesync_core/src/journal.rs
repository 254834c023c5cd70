//! Append-only journal files.
//!
//! Every durable store in a node is a journal of CBOR-encoded events.
//! Each event is written as one frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ len (u32 LE) │ crc (u32 LE) │ CBOR payload (len)  │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! On open the journal is replayed front to back. A damaged frame at the
//! very end is a torn write from a crash and is truncated away; a damaged
//! frame followed by more data is corruption and fails the open.

use crate::error::{CoreError, CoreResult};
use sedesync_protocol::{decode_cbor, encode_cbor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_LEN: usize = 8;

/// An open journal file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
    frames: usize,
}

enum Frame<'a> {
    Complete { payload: &'a [u8], consumed: usize },
    Torn(&'static str),
    Damaged,
}

fn read_frame(bytes: &[u8]) -> Frame<'_> {
    if bytes.len() < HEADER_LEN {
        return Frame::Torn("short header");
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let end = HEADER_LEN + len;
    if bytes.len() < end {
        return Frame::Torn("short payload");
    }
    let payload = &bytes[HEADER_LEN..end];
    if compute_crc32(payload) != crc {
        return if bytes.len() == end {
            Frame::Torn("checksum mismatch in last frame")
        } else {
            Frame::Damaged
        };
    }
    Frame::Complete {
        payload,
        consumed: end,
    }
}

fn encode_frame<T: Serialize>(entry: &T) -> CoreResult<Vec<u8>> {
    let payload = encode_cbor(entry)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::journal_corruption("journal entry larger than 4 GiB"))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

impl Journal {
    /// Opens or creates a journal, returning its replayed entries.
    pub fn open<T: DeserializeOwned>(path: &Path) -> CoreResult<(Self, Vec<T>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match read_frame(&bytes[offset..]) {
                Frame::Complete { payload, consumed } => {
                    let entry = decode_cbor(payload).map_err(|e| {
                        CoreError::journal_corruption(format!(
                            "{}: undecodable frame at offset {offset}: {e}",
                            path.display()
                        ))
                    })?;
                    entries.push(entry);
                    offset += consumed;
                }
                Frame::Torn(why) => {
                    warn!(
                        journal = %path.display(),
                        offset,
                        dropped = bytes.len() - offset,
                        "truncating torn journal tail: {why}"
                    );
                    break;
                }
                Frame::Damaged => {
                    return Err(CoreError::journal_corruption(format!(
                        "{}: checksum mismatch at offset {offset}",
                        path.display()
                    )));
                }
            }
        }

        if offset < bytes.len() {
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(offset as u64))?;

        debug!(journal = %path.display(), frames = entries.len(), "journal replayed");

        let journal = Self {
            path: path.to_path_buf(),
            file,
            len: offset as u64,
            frames: entries.len(),
        };
        Ok((journal, entries))
    }

    /// Appends one entry and flushes it to disk.
    pub fn append<T: Serialize>(&mut self, entry: &T) -> CoreResult<()> {
        let frame = encode_frame(entry)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        self.frames += 1;
        Ok(())
    }

    /// Atomically replaces the journal contents with `entries`.
    pub fn rewrite<T: Serialize>(&mut self, entries: &[T]) -> CoreResult<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut len = 0u64;
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in entries {
                let frame = encode_frame(entry)?;
                tmp.write_all(&frame)?;
                len += frame.len() as u64;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        debug!(
            journal = %self.path.display(),
            before = self.frames,
            after = entries.len(),
            "journal compacted"
        );
        self.file = file;
        self.len = len;
        self.frames = entries.len();
        Ok(())
    }

    /// Size of the journal in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Number of frames currently in the journal.
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Event {
        Put(u64, String),
        Drop(u64),
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");

        let (mut journal, replayed) = Journal::open::<Event>(&path).unwrap();
        assert!(replayed.is_empty());
        journal.append(&Event::Put(1, "a".into())).unwrap();
        journal.append(&Event::Drop(1)).unwrap();
        assert_eq!(journal.frame_count(), 2);
        drop(journal);

        let (journal, replayed) = Journal::open::<Event>(&path).unwrap();
        assert_eq!(replayed, vec![Event::Put(1, "a".into()), Event::Drop(1)]);
        assert_eq!(journal.frame_count(), 2);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");

        let (mut journal, _) = Journal::open::<Event>(&path).unwrap();
        journal.append(&Event::Put(1, "kept".into())).unwrap();
        let good_len = journal.len_bytes();
        drop(journal);

        // Half a frame, as left by a crash mid-write.
        let frame = encode_frame(&Event::Put(2, "lost".into())).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let (mut journal, replayed) = Journal::open::<Event>(&path).unwrap();
        assert_eq!(replayed, vec![Event::Put(1, "kept".into())]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        journal.append(&Event::Drop(1)).unwrap();
        drop(journal);
        let (_, replayed) = Journal::open::<Event>(&path).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn damage_before_the_tail_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");

        let (mut journal, _) = Journal::open::<Event>(&path).unwrap();
        journal.append(&Event::Put(1, "first".into())).unwrap();
        journal.append(&Event::Put(2, "second".into())).unwrap();
        drop(journal);

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN + 1] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Journal::open::<Event>(&path).unwrap_err();
        assert!(matches!(err, CoreError::JournalCorruption { .. }));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");

        let (mut journal, _) = Journal::open::<Event>(&path).unwrap();
        for i in 0..10 {
            journal.append(&Event::Put(i, format!("v{i}"))).unwrap();
        }
        journal.rewrite(&[Event::Put(9, "v9".into())]).unwrap();
        journal.append(&Event::Drop(9)).unwrap();
        drop(journal);

        let (_, replayed) = Journal::open::<Event>(&path).unwrap();
        assert_eq!(replayed, vec![Event::Put(9, "v9".into()), Event::Drop(9)]);
    }
}
