//! Typed accessors over the gossip table family.
//!
//! One store instance wraps a set of producer tables: the global event
//! archive plus the heads, last-event, block, epoch-record, and pointer
//! indexes, and a per-epoch event index that can be dropped wholesale once
//! the epoch falls out of retention. All writes go through the producer's
//! buffered layer, so an insertion and its index updates commit in the
//! same flush.

use crate::Error;
use moira_codec::{Decode, Encode};
use moira_dag::chain::{Block, EpochRecord};
use moira_dag::event::Event;
use moira_dag::types::{BlockIndex, Epoch, EventId, ValidatorId};
use moira_kvdb::producer::{Producer, Store};
use moira_kvdb::Kv;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const LATEST_BLOCK_KEY: &[u8] = b"latest";

/// Typed view of the gossip tables.
pub struct GossipStore {
    producer: Producer,
    events: Arc<Store>,
    heads: Arc<Store>,
    last: Arc<Store>,
    blocks: Arc<Store>,
    epochs: Arc<Store>,
    pointers: Arc<Store>,
    epoch_indexes: Mutex<HashMap<u32, Arc<Store>>>,
}

impl GossipStore {
    pub fn open(producer: &Producer) -> Result<Self, Error> {
        Ok(Self {
            producer: producer.clone(),
            events: Arc::new(producer.open_table("gossip/E")?),
            heads: Arc::new(producer.open_table("gossip/H")?),
            last: Arc::new(producer.open_table("gossip/V")?),
            blocks: Arc::new(producer.open_table("gossip/B")?),
            epochs: Arc::new(producer.open_table("gossip/R")?),
            pointers: Arc::new(producer.open_table("gossip/P")?),
            epoch_indexes: Mutex::new(HashMap::new()),
        })
    }

    fn epoch_index(&self, epoch: Epoch) -> Result<Arc<Store>, Error> {
        let mut indexes = self.epoch_indexes.lock();
        if let Some(store) = indexes.get(&epoch.get()) {
            return Ok(store.clone());
        }
        let store = Arc::new(
            self.producer
                .open_table(&format!("gossip-{}/E", epoch.get()))?,
        );
        indexes.insert(epoch.get(), store.clone());
        Ok(store)
    }

    /// Archives an event and maintains the heads, last-event, and
    /// per-epoch indexes. Events must be inserted parents-first.
    pub fn insert_event(&self, event: &Event) -> Result<(), Error> {
        let id = event.id();
        self.events.put(id.as_bytes(), &event.encode())?;
        self.epoch_index(event.epoch())?.put(id.as_bytes(), &[])?;

        // A new event is a head until something references it.
        self.heads.put(id.as_bytes(), &[])?;
        for parent in event.parents() {
            self.heads.delete(parent.as_bytes())?;
        }

        // Track the highest-seq event per creator. Forked branches at the
        // same seq resolve to whichever arrived last; consumers treat the
        // index as a hint, not a commitment.
        let key = event.creator().get().to_be_bytes();
        let replace = match self.last.get(&key)? {
            Some(prior) if prior.len() >= 4 => {
                let seq = u32::from_be_bytes([prior[0], prior[1], prior[2], prior[3]]);
                event.seq() >= seq
            }
            _ => true,
        };
        if replace {
            let mut value = Vec::with_capacity(36);
            value.extend_from_slice(&event.seq().to_be_bytes());
            value.extend_from_slice(id.as_bytes());
            self.last.put(&key, &value)?;
        }
        Ok(())
    }

    pub fn event(&self, id: &EventId) -> Result<Option<Event>, Error> {
        match self.events.get(id.as_bytes())? {
            Some(raw) => Ok(Some(Event::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn has_event(&self, id: &EventId) -> Result<bool, Error> {
        Ok(self.events.has(id.as_bytes())?)
    }

    /// Current DAG heads: events no archived event references.
    pub fn heads(&self) -> Result<Vec<EventId>, Error> {
        let mut out = Vec::new();
        for pair in self.heads.iterate(&[], None)? {
            let (key, _) = pair?;
            out.push(decode_id(&key)?);
        }
        Ok(out)
    }

    /// The highest-seq archived event of `validator`, if any.
    pub fn last_event_of(&self, validator: ValidatorId) -> Result<Option<EventId>, Error> {
        match self.last.get(&validator.get().to_be_bytes())? {
            Some(value) if value.len() == 36 => decode_id(&value[4..]).map(Some),
            Some(_) | None => Ok(None),
        }
    }

    /// Event ids of one epoch in id order, which is lamport-ascending and
    /// therefore parents-first.
    pub fn epoch_events(&self, epoch: Epoch) -> Result<Vec<EventId>, Error> {
        let index = self.epoch_index(epoch)?;
        let mut out = Vec::new();
        for pair in index.iterate(&[], None)? {
            let (key, _) = pair?;
            out.push(decode_id(&key)?);
        }
        Ok(out)
    }

    pub fn epoch_event_count(&self, epoch: Epoch) -> Result<usize, Error> {
        let index = self.epoch_index(epoch)?;
        let mut count = 0;
        for pair in index.iterate(&[], None)? {
            pair?;
            count += 1;
        }
        Ok(count)
    }

    /// Appends a block and advances the latest-block pointer.
    pub fn put_block(&self, block: &Block) -> Result<(), Error> {
        self.blocks
            .put(&block.index.get().to_be_bytes(), &block.encode())?;
        self.pointers
            .put(LATEST_BLOCK_KEY, &block.index.get().to_be_bytes())?;
        Ok(())
    }

    pub fn block(&self, index: BlockIndex) -> Result<Option<Block>, Error> {
        match self.blocks.get(&index.get().to_be_bytes())? {
            Some(raw) => Ok(Some(Block::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn latest_block_index(&self) -> Result<Option<BlockIndex>, Error> {
        match self.pointers.get(LATEST_BLOCK_KEY)? {
            Some(raw) if raw.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw);
                Ok(Some(BlockIndex::new(u64::from_be_bytes(bytes))))
            }
            Some(_) | None => Ok(None),
        }
    }

    pub fn put_epoch_record(&self, record: &EpochRecord) -> Result<(), Error> {
        self.epochs
            .put(&record.epoch.get().to_be_bytes(), &record.encode())?;
        Ok(())
    }

    pub fn epoch_record(&self, epoch: Epoch) -> Result<Option<EpochRecord>, Error> {
        match self.epochs.get(&epoch.get().to_be_bytes())? {
            Some(raw) => Ok(Some(EpochRecord::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    /// Drops the per-epoch index database of a retired epoch. The global
    /// archive keeps the events themselves.
    pub fn drop_epoch_index(&self, epoch: Epoch) -> Result<(), Error> {
        if let Some(store) = self.epoch_indexes.lock().remove(&epoch.get()) {
            store.close()?;
        }
        self.producer.drop_db(&format!("gossip-{}", epoch.get()))?;
        Ok(())
    }
}

fn decode_id(key: &[u8]) -> Result<EventId, Error> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| moira_codec::Error::InvalidData("EventId", "bad key length".into()))?;
    Ok(EventId(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_dag::event::{EventHeader, Payload};
    use moira_dag::keys::FakeSigner;
    use moira_dag::types::{Frame, Hash, Lamport};
    use moira_kvdb::producer::ProducerConfig;
    use moira_kvdb::routing::Router;

    fn store() -> GossipStore {
        let producer = Producer::in_memory(Router::default_layout(), ProducerConfig::default());
        GossipStore::open(&producer).unwrap()
    }

    fn event(creator: u32, seq: u32, lamport: u32, parents: Vec<EventId>) -> Event {
        let signer = FakeSigner::new(ValidatorId::new(creator));
        let header = EventHeader {
            creator: ValidatorId::new(creator),
            seq,
            epoch: Epoch::new(1),
            frame: Frame::new(1),
            lamport: Lamport::new(lamport),
            parents,
            ..Default::default()
        };
        Event::sign(header, Payload::default(), &signer)
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = store();
        let e = event(0, 1, 1, vec![]);
        store.insert_event(&e).unwrap();
        assert!(store.has_event(&e.id()).unwrap());
        assert_eq!(store.event(&e.id()).unwrap().unwrap(), e);
        assert!(store.event(&EventId::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_heads_follow_insertions() {
        let store = store();
        let a = event(0, 1, 1, vec![]);
        let b = event(1, 1, 1, vec![]);
        store.insert_event(&a).unwrap();
        store.insert_event(&b).unwrap();
        let mut heads = store.heads().unwrap();
        heads.sort();
        let mut want = vec![a.id(), b.id()];
        want.sort();
        assert_eq!(heads, want);

        // A child displaces both its parents.
        let c = event(0, 2, 2, vec![a.id(), b.id()]);
        store.insert_event(&c).unwrap();
        assert_eq!(store.heads().unwrap(), vec![c.id()]);
    }

    #[test]
    fn test_last_event_tracks_highest_seq() {
        let store = store();
        assert!(store.last_event_of(ValidatorId::new(0)).unwrap().is_none());
        let a = event(0, 1, 1, vec![]);
        let b = event(0, 2, 2, vec![a.id()]);
        store.insert_event(&b).unwrap();
        store.insert_event(&a).unwrap();
        // Out-of-order insertion must not roll the index back.
        assert_eq!(store.last_event_of(ValidatorId::new(0)).unwrap(), Some(b.id()));
    }

    #[test]
    fn test_epoch_index_is_ordered_and_droppable() {
        let store = store();
        let a = event(0, 1, 1, vec![]);
        let b = event(1, 1, 1, vec![]);
        let c = event(0, 2, 2, vec![a.id(), b.id()]);
        for e in [&c, &a, &b] {
            store.insert_event(e).unwrap();
        }
        let ids = store.epoch_events(Epoch::new(1)).unwrap();
        assert_eq!(ids.len(), 3);
        // Id order is lamport-ascending: the child comes last.
        assert_eq!(ids[2], c.id());
        assert_eq!(store.epoch_event_count(Epoch::new(1)).unwrap(), 3);

        store.drop_epoch_index(Epoch::new(1)).unwrap();
        assert_eq!(store.epoch_event_count(Epoch::new(1)).unwrap(), 0);
        // The archive is unaffected.
        assert!(store.has_event(&a.id()).unwrap());
    }

    #[test]
    fn test_blocks_and_pointer() {
        let store = store();
        assert!(store.latest_block_index().unwrap().is_none());
        let block = Block {
            index: BlockIndex::new(1),
            timestamp: 7,
            state_root: Hash::of(b"root"),
            ..Default::default()
        };
        store.put_block(&block).unwrap();
        assert_eq!(store.block(BlockIndex::new(1)).unwrap().unwrap(), block);
        assert_eq!(
            store.latest_block_index().unwrap(),
            Some(BlockIndex::new(1))
        );
    }

    #[test]
    fn test_epoch_record_roundtrip() {
        let store = store();
        let record = EpochRecord {
            epoch: Epoch::new(1),
            sealing_frame: Frame::new(20),
            closing_block: BlockIndex::new(3),
            ..Default::default()
        };
        store.put_epoch_record(&record).unwrap();
        assert_eq!(
            store.epoch_record(Epoch::new(1)).unwrap().unwrap(),
            record
        );
        assert!(store.epoch_record(Epoch::new(9)).unwrap().is_none());
    }
}
