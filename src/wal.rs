use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::store::Record;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<Record>,
    /// A torn or corrupt tail was found and ignored.
    pub truncated: bool,
}

/// Append-only write-ahead log of document store mutations.
///
/// Format per entry: `[u32: len][bincode: Record][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated last entry (crash mid-write) fails the length or CRC check
///   and everything from it onwards is discarded on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted temp file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match read_frame_part(&mut reader, &mut len_buf)? {
                Frame::Complete => {}
                Frame::CleanEof => break,
                Frame::Torn => {
                    replay.truncated = true;
                    break;
                }
            }
            let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            let mut crc_buf = [0u8; 4];
            if !matches!(read_frame_part(&mut reader, &mut payload)?, Frame::Complete)
                || !matches!(read_frame_part(&mut reader, &mut crc_buf)?, Frame::Complete)
                || u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload)
            {
                replay.truncated = true;
                break;
            }
            match bincode::deserialize::<Record>(&payload) {
                Ok(record) => replay.records.push(record),
                Err(_) => {
                    replay.truncated = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

enum Frame {
    Complete,
    CleanEof,
    Torn,
}

/// `read_exact` that tells a clean end of log apart from a torn entry.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Frame> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Frame::CleanEof),
            Ok(0) => return Ok(Frame::Torn),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Frame::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::{Collection, Document};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("venuebook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn venue_put(name: &str) -> Record {
        let id = Ulid::new();
        Record::Put {
            collection: Collection::Venues,
            id: id.to_string(),
            doc: Document::Venue(Venue {
                id,
                name: name.into(),
                capacity: 30,
                image_url: None,
            }),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let records = vec![
            venue_put("Computer Lab 3"),
            Record::Delete {
                collection: Collection::Venues,
                id: Ulid::new().to_string(),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, records);
        assert!(!replay.truncated);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let record = venue_put("Sports Complex");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&record).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![record]);
        assert!(replay.truncated);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        {
            let payload = bincode::serialize(&venue_put("Seminar Hall A")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert!(replay.truncated);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.records.is_empty());
        assert!(!replay.truncated);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_then_append.wal");
        let keep = venue_put("Main Auditorium");
        let later = venue_put("Conference Room");
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&venue_put("churn")).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            Wal::write_compact_file(wal.path(), std::slice::from_ref(&keep)).unwrap();
            wal.swap_compact_file().unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.records, vec![keep, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_visible_after_flush() {
        let path = tmp_path("buffered.wal");
        let records: Vec<Record> = (0..5).map(|i| venue_put(&format!("Room {i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().records, records);
        let _ = fs::remove_file(&path);
    }
}
