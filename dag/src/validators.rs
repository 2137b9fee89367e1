//! Validator sets and quorum arithmetic.

use crate::keys::PublicKey;
use crate::types::ValidatorId;
use bytes::{Buf, BufMut};
use moira_codec::{read_vec, vec_size, write_vec, EncodeSize, Error as CodecError, Read, Write};
use std::collections::BTreeMap;

/// Upper bound on validator-set size accepted from untrusted input.
pub const MAX_VALIDATORS: usize = 10_000;

/// One validator's profile within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub weight: u64,
    pub public: PublicKey,
}

/// An epoch's validator set: ids, stake weights, and keys.
///
/// Iteration order is by ascending id everywhere, which fixes the slot
/// layout of vector clocks and the tie-breaking of elections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    entries: BTreeMap<ValidatorId, Profile>,
    total_weight: u64,
}

impl Validators {
    /// Builds a set from (id, profile) pairs. Zero-weight entries are
    /// rejected by ignoring them.
    pub fn build(entries: impl IntoIterator<Item = (ValidatorId, Profile)>) -> Self {
        let entries: BTreeMap<_, _> = entries
            .into_iter()
            .filter(|(_, profile)| profile.weight > 0)
            .collect();
        let total_weight = entries.values().map(|p| p.weight).sum();
        Self {
            entries,
            total_weight,
        }
    }

    /// A fakenet set of `n` equally-weighted validators with ids `1..=n`.
    pub fn fakenet(n: u32) -> Self {
        Self::build((1..=n).map(|i| {
            let id = ValidatorId::new(i);
            (
                id,
                Profile {
                    weight: 1,
                    public: crate::keys::fake_key(id),
                },
            )
        }))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn weight(&self, id: ValidatorId) -> u64 {
        self.entries.get(&id).map_or(0, |p| p.weight)
    }

    pub fn public(&self, id: ValidatorId) -> Option<&PublicKey> {
        self.entries.get(&id).map(|p| &p.public)
    }

    /// Total stake weight `W`.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Byzantine quorum `Q = 2W/3 + 1`.
    pub fn quorum(&self) -> u64 {
        self.total_weight * 2 / 3 + 1
    }

    /// Validator ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValidatorId, &Profile)> + '_ {
        self.entries.iter().map(|(id, profile)| (*id, profile))
    }

    /// The vector-clock slot of a validator, if a member.
    pub fn index_of(&self, id: ValidatorId) -> Option<usize> {
        self.entries.keys().position(|k| *k == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    id: ValidatorId,
    weight: u64,
    public: PublicKey,
}

impl Write for Entry {
    fn write(&self, buf: &mut impl BufMut) {
        self.id.write(buf);
        self.weight.write(buf);
        self.public.write(buf);
    }
}

impl EncodeSize for Entry {
    fn encode_size(&self) -> usize {
        4 + 8 + 32
    }
}

impl Read for Entry {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: ValidatorId::read(buf)?,
            weight: u64::read(buf)?,
            public: PublicKey::read(buf)?,
        })
    }
}

impl Write for Validators {
    fn write(&self, buf: &mut impl BufMut) {
        let entries: Vec<Entry> = self
            .iter()
            .map(|(id, p)| Entry {
                id,
                weight: p.weight,
                public: p.public,
            })
            .collect();
        write_vec(&entries, buf);
    }
}

impl EncodeSize for Validators {
    fn encode_size(&self) -> usize {
        let entries: Vec<Entry> = self
            .iter()
            .map(|(id, p)| Entry {
                id,
                weight: p.weight,
                public: p.public,
            })
            .collect();
        vec_size(&entries)
    }
}

impl Read for Validators {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let entries: Vec<Entry> = read_vec(buf, MAX_VALIDATORS)?;
        Ok(Self::build(entries.into_iter().map(|e| {
            (
                e.id,
                Profile {
                    weight: e.weight,
                    public: e.public,
                },
            )
        })))
    }
}
