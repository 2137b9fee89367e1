//! Content-addressed binary state trie.
//!
//! Keys are 256-bit hashes; nodes are stored under the SHA-256 of their
//! canonical encoding, so a root hash commits to the entire state and any
//! historical root remains readable as long as its nodes are retained.
//! Paths are bit-compressed: a branch carries the bits shared by its whole
//! subtree and one implicit discriminating bit per child.

use crate::Error;
use bytes::{Buf, BufMut};
use moira_codec::{
    bytes_size, read_bytes, write_bytes, Encode, EncodeSize, Error as CodecError, Read, Write,
};
use moira_dag::types::Hash;
use moira_kvdb::Kv;
use std::sync::Arc;

/// A bit string, most significant bit first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BitPath {
    bytes: Vec<u8>,
    len: u16,
}

impl BitPath {
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            bytes: key.to_vec(),
            len: 256,
        }
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn bit(&self, i: u16) -> u8 {
        (self.bytes[usize::from(i / 8)] >> (7 - i % 8)) & 1
    }

    /// The suffix starting at bit `from`.
    pub fn suffix(&self, from: u16) -> Self {
        let len = self.len - from;
        let mut bytes = vec![0u8; usize::from(len.div_ceil(8))];
        for i in 0..len {
            let bit = self.bit(from + i);
            bytes[usize::from(i / 8)] |= bit << (7 - i % 8);
        }
        Self { bytes, len }
    }

    pub fn prefix(&self, len: u16) -> Self {
        let mut out = self.suffix(0);
        out.truncate(len);
        out
    }

    fn truncate(&mut self, len: u16) {
        self.len = len;
        self.bytes.truncate(usize::from(len.div_ceil(8)));
        // Zero the tail bits so equal paths encode identically.
        if len % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xFFu8 << (8 - len % 8);
            }
        }
    }

    pub fn common_prefix_len(&self, other: &Self) -> u16 {
        let max = self.len.min(other.len);
        for i in 0..max {
            if self.bit(i) != other.bit(i) {
                return i;
            }
        }
        max
    }
}

impl Write for BitPath {
    fn write(&self, buf: &mut impl BufMut) {
        self.len.write(buf);
        write_bytes(&self.bytes, buf);
    }
}

impl EncodeSize for BitPath {
    fn encode_size(&self) -> usize {
        2 + bytes_size(&self.bytes)
    }
}

impl Read for BitPath {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let len = u16::read(buf)?;
        let bytes = read_bytes(buf, 33)?;
        if bytes.len() != usize::from(len.div_ceil(8)) {
            return Err(CodecError::InvalidData("BitPath", "length mismatch".into()));
        }
        Ok(Self { bytes, len })
    }
}

const LEAF_TAG: u8 = 0;
const BRANCH_TAG: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    /// Remaining key bits and the stored value.
    Leaf { path: BitPath, value: Vec<u8> },
    /// Bits shared by the subtree; children discriminate on the next bit.
    Branch { path: BitPath, children: [Hash; 2] },
}

impl Node {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.encode())
    }
}

impl Write for Node {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Node::Leaf { path, value } => {
                LEAF_TAG.write(buf);
                path.write(buf);
                write_bytes(value, buf);
            }
            Node::Branch { path, children } => {
                BRANCH_TAG.write(buf);
                path.write(buf);
                children[0].write(buf);
                children[1].write(buf);
            }
        }
    }
}

impl EncodeSize for Node {
    fn encode_size(&self) -> usize {
        match self {
            Node::Leaf { path, value } => 1 + path.encode_size() + bytes_size(value),
            Node::Branch { path, .. } => 1 + path.encode_size() + 64,
        }
    }
}

impl Read for Node {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            LEAF_TAG => Ok(Node::Leaf {
                path: BitPath::read(buf)?,
                value: read_bytes(buf, 1 << 16)?,
            }),
            BRANCH_TAG => Ok(Node::Branch {
                path: BitPath::read(buf)?,
                children: [Hash::read(buf)?, Hash::read(buf)?],
            }),
            other => Err(CodecError::InvalidData("Node", format!("tag {other}"))),
        }
    }
}

/// The trie over one node table. Cheap to clone; roots select snapshots.
#[derive(Clone)]
pub(crate) struct Trie {
    nodes: Arc<dyn Kv>,
}

impl Trie {
    pub fn new(nodes: Arc<dyn Kv>) -> Self {
        Self { nodes }
    }

    pub fn has_node(&self, hash: &Hash) -> Result<bool, Error> {
        Ok(*hash == Hash::ZERO || self.nodes.has(hash.as_bytes())?)
    }

    fn load(&self, hash: &Hash) -> Result<Node, Error> {
        let raw = self
            .nodes
            .get(hash.as_bytes())?
            .ok_or_else(|| Error::MissingState(*hash))?;
        Ok(moira_codec::Decode::decode(raw.as_slice())?)
    }

    fn save(&self, node: &Node) -> Result<Hash, Error> {
        let hash = node.hash();
        self.nodes.put(hash.as_bytes(), &node.encode())?;
        Ok(hash)
    }

    /// Stores a pre-encoded node, verifying its content address.
    pub fn import_node(&self, hash: &Hash, raw: &[u8]) -> Result<(), Error> {
        if Hash::of(raw) != *hash {
            return Err(Error::StateMismatch {
                expected: *hash,
                got: Hash::of(raw),
            });
        }
        // Decode to reject garbage early.
        let _: Node = moira_codec::Decode::decode(raw)?;
        self.nodes.put(hash.as_bytes(), raw)?;
        Ok(())
    }

    pub fn get(&self, root: &Hash, key: &[u8; 32]) -> Result<Option<Vec<u8>>, Error> {
        if *root == Hash::ZERO {
            return Ok(None);
        }
        let mut hash = *root;
        let mut remaining = BitPath::from_key(key);
        loop {
            match self.load(&hash)? {
                Node::Leaf { path, value } => {
                    return Ok((path == remaining).then_some(value));
                }
                Node::Branch { path, children } => {
                    let cp = remaining.common_prefix_len(&path);
                    if cp < path.len() || cp >= remaining.len() {
                        return Ok(None);
                    }
                    let idx = usize::from(remaining.bit(cp));
                    if children[idx] == Hash::ZERO {
                        return Ok(None);
                    }
                    hash = children[idx];
                    remaining = remaining.suffix(cp + 1);
                }
            }
        }
    }

    /// Inserts (or replaces) `key` and returns the new root.
    pub fn insert(&self, root: &Hash, key: &[u8; 32], value: &[u8]) -> Result<Hash, Error> {
        self.insert_at(root, BitPath::from_key(key), value)
    }

    fn insert_at(&self, node: &Hash, remaining: BitPath, value: &[u8]) -> Result<Hash, Error> {
        if *node == Hash::ZERO {
            return self.save(&Node::Leaf {
                path: remaining,
                value: value.to_vec(),
            });
        }
        match self.load(node)? {
            Node::Leaf { path, value: old } => {
                if path == remaining {
                    return self.save(&Node::Leaf {
                        path,
                        value: value.to_vec(),
                    });
                }
                let cp = remaining.common_prefix_len(&path);
                let old_leaf = self.save(&Node::Leaf {
                    path: path.suffix(cp + 1),
                    value: old,
                })?;
                let new_leaf = self.save(&Node::Leaf {
                    path: remaining.suffix(cp + 1),
                    value: value.to_vec(),
                })?;
                let mut children = [Hash::ZERO; 2];
                children[usize::from(path.bit(cp))] = old_leaf;
                children[usize::from(remaining.bit(cp))] = new_leaf;
                self.save(&Node::Branch {
                    path: remaining.prefix(cp),
                    children,
                })
            }
            Node::Branch { path, children } => {
                let cp = remaining.common_prefix_len(&path);
                if cp == path.len() {
                    let idx = usize::from(remaining.bit(cp));
                    let child =
                        self.insert_at(&children[idx], remaining.suffix(cp + 1), value)?;
                    let mut children = children;
                    children[idx] = child;
                    self.save(&Node::Branch { path, children })
                } else {
                    // Diverges inside the branch prefix: split it.
                    let old_branch = self.save(&Node::Branch {
                        path: path.suffix(cp + 1),
                        children,
                    })?;
                    let new_leaf = self.save(&Node::Leaf {
                        path: remaining.suffix(cp + 1),
                        value: value.to_vec(),
                    })?;
                    let mut split = [Hash::ZERO; 2];
                    split[usize::from(path.bit(cp))] = old_branch;
                    split[usize::from(remaining.bit(cp))] = new_leaf;
                    self.save(&Node::Branch {
                        path: remaining.prefix(cp),
                        children: split,
                    })
                }
            }
        }
    }

    /// Walks the whole subtree under `root`, verifying every content
    /// address. Returns the number of nodes visited.
    pub fn verify(&self, root: &Hash) -> Result<usize, Error> {
        if *root == Hash::ZERO {
            return Ok(0);
        }
        let raw = self
            .nodes
            .get(root.as_bytes())?
            .ok_or_else(|| Error::MissingState(*root))?;
        if Hash::of(&raw) != *root {
            return Err(Error::StateMismatch {
                expected: *root,
                got: Hash::of(&raw),
            });
        }
        let node: Node = moira_codec::Decode::decode(raw.as_slice())?;
        let mut visited = 1;
        if let Node::Branch { children, .. } = node {
            for child in children {
                if child != Hash::ZERO {
                    visited += self.verify(&child)?;
                }
            }
        }
        Ok(visited)
    }

    /// Streams every (hash, encoding) pair reachable from `root`.
    pub fn export(
        &self,
        root: &Hash,
        out: &mut impl FnMut(&Hash, &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if *root == Hash::ZERO {
            return Ok(());
        }
        let raw = self
            .nodes
            .get(root.as_bytes())?
            .ok_or_else(|| Error::MissingState(*root))?;
        out(root, &raw)?;
        let node: Node = moira_codec::Decode::decode(raw.as_slice())?;
        if let Node::Branch { children, .. } = node {
            for child in children {
                if child != Hash::ZERO {
                    self.export(&child, out)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_kvdb::memory::Memory;

    fn key(n: u8) -> [u8; 32] {
        *Hash::of(&[n]).as_bytes()
    }

    fn trie() -> Trie {
        Trie::new(Arc::new(Memory::new()))
    }

    #[test]
    fn test_insert_get() {
        let trie = trie();
        let mut root = Hash::ZERO;
        for n in 0..50u8 {
            root = trie.insert(&root, &key(n), &[n]).unwrap();
        }
        for n in 0..50u8 {
            assert_eq!(trie.get(&root, &key(n)).unwrap().unwrap(), vec![n]);
        }
        assert!(trie.get(&root, &key(99)).unwrap().is_none());
    }

    #[test]
    fn test_replace_value() {
        let trie = trie();
        let root = trie.insert(&Hash::ZERO, &key(1), b"a").unwrap();
        let root = trie.insert(&root, &key(1), b"b").unwrap();
        assert_eq!(trie.get(&root, &key(1)).unwrap().unwrap(), b"b");
    }

    #[test]
    fn test_roots_are_snapshots() {
        let trie = trie();
        let r1 = trie.insert(&Hash::ZERO, &key(1), b"a").unwrap();
        let r2 = trie.insert(&r1, &key(2), b"x").unwrap();
        let r3 = trie.insert(&r2, &key(1), b"b").unwrap();
        // Old roots keep reading old values.
        assert_eq!(trie.get(&r1, &key(1)).unwrap().unwrap(), b"a");
        assert!(trie.get(&r1, &key(2)).unwrap().is_none());
        assert_eq!(trie.get(&r2, &key(1)).unwrap().unwrap(), b"a");
        assert_eq!(trie.get(&r3, &key(1)).unwrap().unwrap(), b"b");
        assert_eq!(trie.get(&r3, &key(2)).unwrap().unwrap(), b"x");
    }

    #[test]
    fn test_root_is_order_independent() {
        let trie = trie();
        let mut forward = Hash::ZERO;
        for n in 0..20u8 {
            forward = trie.insert(&forward, &key(n), &[n]).unwrap();
        }
        let mut backward = Hash::ZERO;
        for n in (0..20u8).rev() {
            backward = trie.insert(&backward, &key(n), &[n]).unwrap();
        }
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_verify_and_export_roundtrip() {
        let trie = trie();
        let mut root = Hash::ZERO;
        for n in 0..10u8 {
            root = trie.insert(&root, &key(n), &[n]).unwrap();
        }
        let visited = trie.verify(&root).unwrap();
        assert!(visited >= 10);

        // Export into a fresh trie and verify the same root reads back.
        let copy = Trie::new(Arc::new(Memory::new()));
        trie.export(&root, &mut |hash, raw| copy.import_node(hash, raw))
            .unwrap();
        assert_eq!(copy.verify(&root).unwrap(), visited);
        for n in 0..10u8 {
            assert_eq!(copy.get(&root, &key(n)).unwrap().unwrap(), vec![n]);
        }
    }

    #[test]
    fn test_import_rejects_bad_hash() {
        let trie = trie();
        let node = Node::Leaf {
            path: BitPath::from_key(&key(1)),
            value: b"v".to_vec(),
        };
        let raw = node.encode();
        assert!(trie.import_node(&Hash::of(b"wrong"), &raw).is_err());
        trie.import_node(&node.hash(), &raw).unwrap();
    }
}
