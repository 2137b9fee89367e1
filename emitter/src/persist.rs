//! Doublesign-protection files.
//!
//! Three fixed-size records survive restarts: the previously emitted
//! event, the last block vote, and the last epoch vote. Each is rewritten
//! in place at offset 0 and synced, so a crash leaves either the old or
//! the new record, never a torn file of stale length.

use crate::Error;
use bytes::{Buf, BufMut};
use moira_codec::{Decode, Encode, EncodeSize, Error as CodecError, Read, Write};
use moira_dag::event::{BlockVote, EpochVote};
use moira_dag::types::{Epoch, EventId};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

const PREV_EVENT_FILE: &str = "emitter-prev-event";
const BLOCK_VOTE_FILE: &str = "emitter-block-vote";
const EPOCH_VOTE_FILE: &str = "emitter-epoch-vote";

/// The last event this validator emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrevEvent {
    pub id: EventId,
    pub epoch: Epoch,
    pub seq: u32,
    /// Creator wall clock of the emission, unix nanoseconds.
    pub creation_time: u64,
}

impl Write for PrevEvent {
    fn write(&self, buf: &mut impl BufMut) {
        self.id.write(buf);
        self.epoch.write(buf);
        self.seq.write(buf);
        self.creation_time.write(buf);
    }
}

impl EncodeSize for PrevEvent {
    fn encode_size(&self) -> usize {
        32 + 4 + 4 + 8
    }
}

impl Read for PrevEvent {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: EventId::read(buf)?,
            epoch: Epoch::read(buf)?,
            seq: u32::read(buf)?,
            creation_time: u64::read(buf)?,
        })
    }
}

/// The emitter's persistence directory.
pub struct EmitterFiles {
    dir: PathBuf,
}

impl EmitterFiles {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn write_fixed(&self, name: &str, record: &[u8]) -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.dir.join(name))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(record)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_fixed(&self, name: &str, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut file = match File::open(self.dir.join(name)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut record = vec![0u8; len];
        file.read_exact(&mut record)?;
        Ok(Some(record))
    }

    pub fn save_prev_event(&self, prev: &PrevEvent) -> Result<(), Error> {
        self.write_fixed(PREV_EVENT_FILE, &prev.encode())
    }

    pub fn load_prev_event(&self) -> Result<Option<PrevEvent>, Error> {
        match self.read_fixed(PREV_EVENT_FILE, 48)? {
            Some(raw) => Ok(Some(PrevEvent::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn save_block_vote(&self, vote: &BlockVote) -> Result<(), Error> {
        self.write_fixed(BLOCK_VOTE_FILE, &vote.encode())
    }

    pub fn load_block_vote(&self) -> Result<Option<BlockVote>, Error> {
        match self.read_fixed(BLOCK_VOTE_FILE, 40)? {
            Some(raw) => Ok(Some(BlockVote::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn save_epoch_vote(&self, vote: &EpochVote) -> Result<(), Error> {
        self.write_fixed(EPOCH_VOTE_FILE, &vote.encode())
    }

    pub fn load_epoch_vote(&self) -> Result<Option<EpochVote>, Error> {
        match self.read_fixed(EPOCH_VOTE_FILE, 36)? {
            Some(raw) => Ok(Some(EpochVote::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_dag::types::{BlockIndex, Hash};

    #[test]
    fn test_missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let files = EmitterFiles::open(dir.path()).unwrap();
        assert!(files.load_prev_event().unwrap().is_none());
        assert!(files.load_block_vote().unwrap().is_none());
        assert!(files.load_epoch_vote().unwrap().is_none());
    }

    #[test]
    fn test_records_roundtrip_and_overwrite_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let files = EmitterFiles::open(dir.path()).unwrap();

        let first = PrevEvent {
            id: EventId::assemble(Epoch::new(1), moira_dag::types::Lamport::new(3), &[7; 24]),
            epoch: Epoch::new(1),
            seq: 3,
            creation_time: 1_000,
        };
        files.save_prev_event(&first).unwrap();
        assert_eq!(files.load_prev_event().unwrap().unwrap(), first);

        let second = PrevEvent {
            seq: 4,
            creation_time: 2_000,
            ..first
        };
        files.save_prev_event(&second).unwrap();
        assert_eq!(files.load_prev_event().unwrap().unwrap(), second);
        // Fixed-size rewrite: the file never grows.
        let len = std::fs::metadata(dir.path().join(PREV_EVENT_FILE))
            .unwrap()
            .len();
        assert_eq!(len, 48);

        let vote = BlockVote {
            index: BlockIndex::new(9),
            hash: Hash::of(b"block"),
        };
        files.save_block_vote(&vote).unwrap();
        assert_eq!(files.load_block_vote().unwrap().unwrap(), vote);

        let vote = EpochVote {
            epoch: Epoch::new(2),
            hash: Hash::of(b"record"),
        };
        files.save_epoch_vote(&vote).unwrap();
        assert_eq!(files.load_epoch_vote().unwrap().unwrap(), vote);
    }
}
