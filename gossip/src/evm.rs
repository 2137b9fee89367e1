//! EVM-facing state: accounts in a content-addressed trie, receipts, and
//! the log indexes.
//!
//! The instruction set itself lives outside the core; what the core owns
//! is durable state addressed by root hash, receipt-based transaction
//! dedup, and block/topic log lookup.

use crate::trie::Trie;
use crate::Error;
use moira_codec::{Decode, Encode, EncodeSize, Error as CodecError, Read as CodecRead, Write};
use moira_dag::chain::{LogEntry, Receipt};
use moira_dag::types::{Address, BlockIndex, Hash};
use moira_kvdb::producer::{Producer, Store};
use moira_kvdb::Kv;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;

/// A minimal account record stored in the state trie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: u64,
}

impl Write for Account {
    fn write(&self, buf: &mut impl bytes::BufMut) {
        self.nonce.write(buf);
        self.balance.write(buf);
    }
}

impl EncodeSize for Account {
    fn encode_size(&self) -> usize {
        16
    }
}

impl CodecRead for Account {
    fn read(buf: &mut impl bytes::Buf) -> Result<Self, CodecError> {
        Ok(Self {
            nonce: u64::read(buf)?,
            balance: u64::read(buf)?,
        })
    }
}

/// State, receipts, and log indexes.
pub struct EvmStore {
    trie: Trie,
    receipts: Arc<Store>,
    log_records: Arc<Store>,
    log_topics: Arc<Store>,
}

impl EvmStore {
    pub fn open(producer: &Producer) -> Result<Self, Error> {
        Ok(Self {
            trie: Trie::new(Arc::new(producer.open_table("evm/M")?)),
            receipts: Arc::new(producer.open_table("evm/R")?),
            log_records: Arc::new(producer.open_table("evm-logs/r")?),
            log_topics: Arc::new(producer.open_table("evm-logs/t")?),
        })
    }

    /// Opens a mutable state view at `root`. Fails if the root node is not
    /// locally available.
    pub fn state_db(&self, root: Hash) -> Result<StateDb, Error> {
        if !self.trie.has_node(&root)? {
            return Err(Error::MissingState(root));
        }
        Ok(StateDb {
            trie: self.trie.clone(),
            root,
        })
    }

    pub fn has_state_db(&self, root: &Hash) -> Result<bool, Error> {
        self.trie.has_node(root)
    }

    pub fn put_receipt(&self, receipt: &Receipt) -> Result<(), Error> {
        self.receipts
            .put(receipt.tx_hash.as_bytes(), &receipt.encode())?;
        Ok(())
    }

    pub fn receipt(&self, tx_hash: &Hash) -> Result<Option<Receipt>, Error> {
        match self.receipts.get(tx_hash.as_bytes())? {
            Some(raw) => Ok(Some(Receipt::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    /// A present receipt marks the transaction as already applied; the
    /// processor skips re-executions on this basis.
    pub fn has_receipt(&self, tx_hash: &Hash) -> Result<bool, Error> {
        Ok(self.receipts.has(tx_hash.as_bytes())?)
    }

    /// Indexes `logs` under `block`, starting at in-block position
    /// `first_position`. Returns the next free position.
    pub fn index_logs(
        &self,
        block: BlockIndex,
        first_position: u32,
        logs: &[LogEntry],
    ) -> Result<u32, Error> {
        let mut position = first_position;
        for log in logs {
            let mut key = Vec::with_capacity(12);
            key.extend_from_slice(&block.get().to_be_bytes());
            key.extend_from_slice(&position.to_be_bytes());
            self.log_records.put(&key, &log.encode())?;
            for topic in &log.topics {
                let mut tkey = Vec::with_capacity(44);
                tkey.extend_from_slice(topic.as_bytes());
                tkey.extend_from_slice(&block.get().to_be_bytes());
                tkey.extend_from_slice(&position.to_be_bytes());
                self.log_topics.put(&tkey, &[])?;
            }
            position += 1;
        }
        Ok(position)
    }

    /// Logs carrying `topic` within `[from, to]`, in block/position order.
    pub fn logs_by_topic(
        &self,
        topic: &Hash,
        from: BlockIndex,
        to: BlockIndex,
    ) -> Result<Vec<LogEntry>, Error> {
        let mut start = Vec::with_capacity(40);
        start.extend_from_slice(topic.as_bytes());
        start.extend_from_slice(&from.get().to_be_bytes());
        let mut out = Vec::new();
        for pair in self.log_topics.iterate(topic.as_bytes(), Some(&start))? {
            let (key, _) = pair?;
            if key.len() != 44 {
                continue;
            }
            let mut block = [0u8; 8];
            block.copy_from_slice(&key[32..40]);
            if u64::from_be_bytes(block) > to.get() {
                break;
            }
            if let Some(raw) = self.log_records.get(&key[32..])? {
                out.push(LogEntry::decode(raw.as_slice())?);
            }
        }
        Ok(out)
    }

    /// Verifies every state node reachable from `root`. Returns the node
    /// count.
    pub fn check_state(&self, root: &Hash) -> Result<usize, Error> {
        self.trie.verify(root)
    }

    /// Rewrites the state under `root` into `nodes`, checking every
    /// content address on the way in and verifying the root is fully
    /// reachable in the target afterwards. Returns the node count.
    pub fn dump_state(&self, root: &Hash, nodes: moira_kvdb::SharedKv) -> Result<usize, Error> {
        let target = Trie::new(nodes);
        self.trie
            .export(root, &mut |hash, raw| target.import_node(hash, raw))?;
        target.verify(root)
    }

    /// Streams the state under `root` as length-framed
    /// `hash ‖ len (4, BE) ‖ node` records.
    pub fn export_state(&self, root: &Hash, writer: &mut impl io::Write) -> Result<usize, Error> {
        let mut count = 0usize;
        self.trie.export(root, &mut |hash, raw| {
            writer.write_all(hash.as_bytes())?;
            let len = u32::try_from(raw.len())
                .map_err(|_| CodecError::InvalidData("Node", "oversized".into()))?;
            writer.write_all(&len.to_be_bytes())?;
            writer.write_all(raw)?;
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Imports state nodes framed by [EvmStore::export_state], verifying
    /// each content address. Returns the node count.
    pub fn import_state(&self, reader: &mut impl io::Read) -> Result<usize, Error> {
        let mut count = 0usize;
        loop {
            let mut hash = [0u8; 32];
            match reader.read_exact(&mut hash) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(count),
                Err(err) => return Err(err.into()),
            }
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            let mut raw = vec![0u8; u32::from_be_bytes(len) as usize];
            reader.read_exact(&mut raw)?;
            self.trie.import_node(&Hash(hash), &raw)?;
            count += 1;
        }
    }
}

/// A mutable account view rooted at one state root. Writes produce new
/// roots; the underlying trie keeps prior roots readable.
pub struct StateDb {
    trie: Trie,
    root: Hash,
}

impl StateDb {
    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, Error> {
        match self.trie.get(&self.root, &account_key(address))? {
            Some(raw) => Ok(Some(Account::decode(raw.as_slice())?)),
            None => Ok(None),
        }
    }

    pub fn set_account(&mut self, address: &Address, account: &Account) -> Result<(), Error> {
        self.root = self
            .trie
            .insert(&self.root, &account_key(address), &account.encode())?;
        Ok(())
    }
}

fn account_key(address: &Address) -> [u8; 32] {
    let digest = Sha256::digest(address.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_kvdb::producer::ProducerConfig;
    use moira_kvdb::routing::Router;
    use moira_kvdb::Kv;

    fn evm() -> EvmStore {
        let producer = Producer::in_memory(Router::default_layout(), ProducerConfig::default());
        EvmStore::open(&producer).unwrap()
    }

    fn addr(n: u8) -> Address {
        Address([n; 20])
    }

    #[test]
    fn test_accounts_roundtrip_through_roots() {
        let evm = evm();
        let mut state = evm.state_db(Hash::ZERO).unwrap();
        assert!(state.account(&addr(1)).unwrap().is_none());

        state
            .set_account(&addr(1), &Account { nonce: 1, balance: 50 })
            .unwrap();
        state
            .set_account(&addr(2), &Account { nonce: 0, balance: 9 })
            .unwrap();
        let root = state.root();

        let reopened = evm.state_db(root).unwrap();
        assert_eq!(
            reopened.account(&addr(1)).unwrap().unwrap(),
            Account { nonce: 1, balance: 50 }
        );
        assert_eq!(
            reopened.account(&addr(2)).unwrap().unwrap(),
            Account { nonce: 0, balance: 9 }
        );
    }

    #[test]
    fn test_state_db_requires_known_root() {
        let evm = evm();
        assert!(matches!(
            evm.state_db(Hash::of(b"unknown")),
            Err(Error::MissingState(_))
        ));
        assert!(!evm.has_state_db(&Hash::of(b"unknown")).unwrap());
        assert!(evm.has_state_db(&Hash::ZERO).unwrap());
    }

    #[test]
    fn test_receipts_mark_applied() {
        let evm = evm();
        let receipt = Receipt {
            tx_hash: Hash::of(b"tx"),
            ok: true,
            gas_used: 21_000,
            logs: vec![],
        };
        assert!(!evm.has_receipt(&receipt.tx_hash).unwrap());
        evm.put_receipt(&receipt).unwrap();
        assert!(evm.has_receipt(&receipt.tx_hash).unwrap());
        assert_eq!(evm.receipt(&receipt.tx_hash).unwrap().unwrap(), receipt);
    }

    #[test]
    fn test_log_index_by_topic_and_range() {
        let evm = evm();
        let topic = Hash::of(b"transfer");
        let other = Hash::of(b"other");
        let log = |data: u8, topics: Vec<Hash>| LogEntry {
            address: addr(1),
            topics,
            data: vec![data],
        };
        evm.index_logs(
            BlockIndex::new(1),
            0,
            &[log(1, vec![topic]), log(2, vec![other])],
        )
        .unwrap();
        evm.index_logs(BlockIndex::new(2), 0, &[log(3, vec![topic, other])])
            .unwrap();
        evm.index_logs(BlockIndex::new(5), 0, &[log(4, vec![topic])])
            .unwrap();

        let found = evm
            .logs_by_topic(&topic, BlockIndex::new(1), BlockIndex::new(4))
            .unwrap();
        let data: Vec<u8> = found.iter().map(|l| l.data[0]).collect();
        assert_eq!(data, vec![1, 3]);

        let all = evm
            .logs_by_topic(&topic, BlockIndex::new(0), BlockIndex::new(u64::MAX))
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_state_export_import() {
        let evm = evm();
        let mut state = evm.state_db(Hash::ZERO).unwrap();
        for n in 0..20u8 {
            state
                .set_account(&addr(n), &Account { nonce: n as u64, balance: 1 })
                .unwrap();
        }
        let root = state.root();
        let nodes = evm.check_state(&root).unwrap();

        let mut framed = Vec::new();
        assert_eq!(evm.export_state(&root, &mut framed).unwrap(), nodes);

        let fresh = {
            let producer =
                Producer::in_memory(Router::default_layout(), ProducerConfig::default());
            EvmStore::open(&producer).unwrap()
        };
        assert_eq!(
            fresh.import_state(&mut framed.as_slice()).unwrap(),
            nodes
        );
        assert_eq!(fresh.check_state(&root).unwrap(), nodes);
        assert_eq!(
            fresh
                .state_db(root)
                .unwrap()
                .account(&addr(7))
                .unwrap()
                .unwrap()
                .nonce,
            7
        );
    }

    #[test]
    fn test_dump_state_reproduces_root() {
        let evm = evm();
        let mut state = evm.state_db(Hash::ZERO).unwrap();
        for n in 0..10u8 {
            state
                .set_account(&addr(n), &Account { nonce: 1, balance: n as u64 })
                .unwrap();
        }
        let root = state.root();
        let nodes = evm.check_state(&root).unwrap();

        let target: moira_kvdb::SharedKv = Arc::new(moira_kvdb::memory::Memory::new());
        assert_eq!(evm.dump_state(&root, target.clone()).unwrap(), nodes);
        assert!(target.has(root.as_bytes()).unwrap());
    }
}
