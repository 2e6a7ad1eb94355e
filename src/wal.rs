use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::id::{IdempotencyKey, ResourceId};
use crate::model::{Allocation, EventRecord, Hold};
use crate::timeline::DeltaTimeline;

/// Append-only Write-Ahead Log.
///
/// Format per record: `[u32: len][bincode: WalRecord][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt trailing record (crash) is discarded on replay.
///
/// One committed command is one record, so a multi-resource command's
/// events are durable all together or not at all.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    appends_since_compact: u64,
}

/// One framed WAL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Full-state checkpoint written by compaction; always the first
    /// record of a compacted file.
    Checkpoint(Checkpoint),
    /// One committed command: its per-resource events plus the
    /// idempotency binding that produced them.
    Command(CommandRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub idem: Option<(IdempotencyKey, [u8; 32])>,
    pub events: Vec<(ResourceId, EventRecord)>,
}

/// Everything needed to rebuild the engine without the pre-checkpoint tail.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub books: Vec<BookState>,
    pub holds: Vec<Hold>,
    pub allocations: Vec<Allocation>,
    pub idem: Vec<IdemState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookState {
    pub resource: ResourceId,
    pub supply: DeltaTimeline,
    pub allocation: DeltaTimeline,
    pub base_seq: u64,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdemState {
    pub key: IdempotencyKey,
    pub command_hash: [u8; 32],
    pub events: Vec<(ResourceId, EventRecord)>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            appends_since_compact: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Buffer a record without flushing. Pair with `flush_sync` — the
    /// group-commit writer batches several appends per fsync.
    pub fn append_buffered(&mut self, record: &WalRecord) -> io::Result<()> {
        write_framed(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Write a compacted file next to the live one: a single checkpoint
    /// record, fsynced. `swap_compact_file` makes it live.
    pub fn write_compact_file(path: &Path, checkpoint: &Checkpoint) -> io::Result<()> {
        let tmp = compact_path(path);
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        write_framed(&mut writer, &WalRecord::Checkpoint(checkpoint.clone()))?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomically replace the live WAL with the compacted file and reopen
    /// the writer on it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        std::fs::rename(compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk, returning all valid records in order.
    /// Truncated/corrupt trailing records are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            if stored_crc != crc32fast::hash(&payload) {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(records)
    }
}

fn write_framed<W: Write>(writer: &mut W, record: &WalRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())
}

fn compact_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".compact");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventBody, Span};
    use std::fs;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tapline_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(&format!("urn:tap:resource:{s}")).unwrap()
    }

    fn supply_record(resource: &ResourceId, seq: u64) -> CommandRecord {
        CommandRecord {
            idem: Some((IdempotencyKey::new(format!("K{seq}")), [7u8; 32])),
            events: vec![(
                resource.clone(),
                EventRecord {
                    seq,
                    ts: 1_000,
                    source_idem: Some(IdempotencyKey::new(format!("K{seq}"))),
                    body: EventBody::SupplyDeltaApplied {
                        resource: resource.clone(),
                        span: Span::new(1_000, 2_000),
                        delta: 1,
                    },
                },
            )],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let r = rid("a");
        let records = vec![
            WalRecord::Command(supply_record(&r, 0)),
            WalRecord::Command(supply_record(&r, 1)),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for rec in &records {
                wal.append_buffered(rec).unwrap();
            }
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let r = rid("a");
        let record = WalRecord::Command(supply_record(&r, 0));

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&record).unwrap();
            wal.flush_sync().unwrap();
        }

        // Append garbage to simulate a truncated second record
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![record]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let record = WalRecord::Command(supply_record(&rid("a"), 0));

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&record).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_swap_resets_counter() {
        let path = tmp_path("compact_swap.wal");
        let r = rid("a");

        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&WalRecord::Command(supply_record(&r, 0)))
            .unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);

        let checkpoint = Checkpoint {
            books: vec![BookState {
                resource: r.clone(),
                supply: DeltaTimeline::new(0),
                allocation: DeltaTimeline::new(0),
                base_seq: 1,
                events: Vec::new(),
            }],
            ..Default::default()
        };
        Wal::write_compact_file(wal.path(), &checkpoint).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![WalRecord::Checkpoint(checkpoint)]);

        let _ = fs::remove_file(&path);
    }
}
