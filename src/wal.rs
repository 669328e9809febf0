use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{Event, Ms};

/// One committed transaction: its events are applied together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub committed_at: Ms,
    pub events: Vec<Event>,
}

/// Result of reading a log back.
#[derive(Debug, Default)]
pub struct Replay {
    pub commits: Vec<Commit>,
    /// A partial or corrupt record was found and everything from it on was ignored.
    pub truncated: bool,
}

fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only write-ahead log of commits.
///
/// Format per record: `[u32: len][bincode: Commit][u32: crc32]`, little-endian.
/// A torn last record (crash mid-write) fails its length or CRC check and is dropped.
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
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a record; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        encode_commit(&mut self.writer, commit)?;
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

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the compacted file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact commit. A missing file is an empty log.
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
            match read_record_part(&mut reader, &mut len_buf)? {
                Part::Complete => {}
                Part::Eof => break,
                Part::Torn => {
                    replay.truncated = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if read_record_part(&mut reader, &mut payload)? != Part::Complete
                || read_record_part(&mut reader, &mut crc_buf)? != Part::Complete
            {
                replay.truncated = true;
                break;
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.truncated = true;
                break;
            }

            match bincode::deserialize::<Commit>(&payload) {
                Ok(commit) => replay.commits.push(commit),
                Err(_) => {
                    replay.truncated = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Part {
    Complete,
    /// Clean end of file before the first byte.
    Eof,
    /// End of file partway through.
    Torn,
}

fn read_record_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Part> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(Part::Eof),
            Ok(0) => return Ok(Part::Torn),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Part::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Profile, Role, User};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn user(id: &str, seq: u64) -> User {
        User {
            id: id.into(),
            seq,
            profile: Profile {
                name: "Ana".into(),
                surname: "García".into(),
                age: 30,
                phone: "600000000".into(),
                email: "ana@example.com".into(),
            },
            role: Role::Client,
            push_tokens: Vec::new(),
            deleted: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn registration(id: &str, seq: u64) -> Commit {
        Commit {
            committed_at: seq as Ms,
            events: vec![Event::UserRegistered {
                user: user(id, seq),
                business: None,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let commits = vec![
            registration("u1", 1),
            Commit {
                committed_at: 10,
                events: vec![
                    Event::PushTokenAdded {
                        user_id: "u1".into(),
                        token: "tok".into(),
                        at: 10,
                    },
                    Event::AccountDeleted {
                        user_id: "u1".into(),
                        at: 10,
                    },
                ],
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(!replay.truncated);
        assert_eq!(replay.commits, commits);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let commit = registration("u1", 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
        }

        // partial length + some bytes of a second record
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.truncated);
        assert_eq!(replay.commits, vec![commit]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
        assert!(!replay.truncated);
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&registration("u1", 1)).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.commits.is_empty());
        assert!(replay.truncated);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let snapshot = vec![registration("u1", 1)];
        let later = registration("u2", 2);

        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                wal.append(&Commit {
                    committed_at: i,
                    events: vec![Event::PushTokenAdded {
                        user_id: "u1".into(),
                        token: format!("tok-{i}"),
                        at: i,
                    }],
                })
                .unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            wal.append(&later).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, vec![snapshot[0].clone(), later]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let commits: Vec<Commit> = (1..=5).map(|i| registration(&format!("u{i}"), i)).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits, commits);

        let _ = fs::remove_file(&path);
    }
}
