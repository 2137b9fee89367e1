//! Declarative routing from logical table paths to physical databases.
//!
//! A logical path has the shape `<group>[-<epoch>][/<table>]`:
//!
//! - `gossip/E` — table `E` of the `gossip` group, which lives inside the
//!   shared `main` database under the key prefix `gossip/E/`.
//! - `hashgraph-7` — the epoch-7 partition of the `hashgraph` group, a
//!   dedicated database created on first open and dropped explicitly after
//!   the retention window.
//! - `evm-logs/t` — the topics table of the log index, routed to the
//!   hybrid backend.
//!
//! The layout is versioned: every physical database carries
//! [LAYOUT_VERSION] under a reserved key, and a mismatch refuses to open
//! until an explicit `db transform` migration.

use crate::Error;

/// Reserved first byte for producer metadata keys. Table prefixes are
/// ASCII paths and can never collide with it.
pub const RESERVED_PREFIX: u8 = 0xF0;

/// Key carrying the flush-ID marker (dirty/clean byte ‖ id).
pub const FLUSH_ID_KEY: [u8; 2] = [RESERVED_PREFIX, b'f'];

/// Key carrying the on-disk tables-layout version.
pub const LAYOUT_KEY: [u8; 2] = [RESERVED_PREFIX, b'l'];

/// Current tables-layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Which engine backs a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-memory (fakenet and tests).
    Memory,
    /// LSM (rocksdb).
    Rocks,
    /// B-tree/LSM hybrid (sled).
    Tree,
}

/// A resolved physical location for a logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub backend: BackendKind,
    /// Physical database name (a directory under the datadir).
    pub db: String,
    /// In-database key prefix; empty for dedicated databases.
    pub prefix: Vec<u8>,
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Group name, e.g. `gossip`.
    pub group: &'static str,
    /// When true the rule matches only `<group>-<epoch>` partition
    /// instances; the bare group name is covered by a separate rule.
    /// Partition databases are created implicitly on first open and
    /// dropped explicitly after the retention window.
    pub partitioned: bool,
    pub backend: BackendKind,
    /// When set, the group shares this physical database and scopes its
    /// keys by prefix; otherwise every group instance owns a database.
    pub shared_db: Option<&'static str>,
}

/// The routing table.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<Rule>,
}

impl Router {
    /// The node's standard layout.
    pub fn default_layout() -> Self {
        Self {
            rules: vec![
                Rule {
                    group: "gossip",
                    partitioned: false,
                    backend: BackendKind::Rocks,
                    shared_db: Some("main"),
                },
                Rule {
                    group: "gossip",
                    partitioned: true,
                    backend: BackendKind::Rocks,
                    shared_db: None,
                },
                Rule {
                    group: "evm",
                    partitioned: false,
                    backend: BackendKind::Rocks,
                    shared_db: Some("main"),
                },
                Rule {
                    group: "evm-logs",
                    partitioned: false,
                    backend: BackendKind::Tree,
                    shared_db: None,
                },
                Rule {
                    group: "hashgraph",
                    partitioned: false,
                    backend: BackendKind::Rocks,
                    shared_db: None,
                },
                Rule {
                    group: "hashgraph",
                    partitioned: true,
                    backend: BackendKind::Rocks,
                    shared_db: None,
                },
            ],
        }
    }

    /// A layout backed entirely by memory, for fakenet and tests.
    pub fn in_memory(&self) -> Self {
        let mut rules = self.rules.clone();
        for rule in &mut rules {
            rule.backend = BackendKind::Memory;
        }
        Self { rules }
    }

    /// Resolves a logical path to its physical location.
    pub fn resolve(&self, logical: &str) -> Result<Route, Error> {
        let (head, table) = match logical.split_once('/') {
            Some((head, table)) => (head, Some(table)),
            None => (logical, None),
        };
        let rule = self
            .rules
            .iter()
            .find(|rule| Self::matches(rule, head))
            .ok_or_else(|| Error::UnknownRoute(logical.to_string()))?;

        let route = match rule.shared_db {
            Some(shared) => {
                // Tables inside a shared database are scoped by their full
                // logical path; the trailing separator keeps the prefixes
                // free of one another.
                let mut prefix = logical.as_bytes().to_vec();
                prefix.push(b'/');
                Route {
                    backend: rule.backend,
                    db: shared.to_string(),
                    prefix,
                }
            }
            None => {
                let prefix = match table {
                    Some(table) => {
                        let mut prefix = table.as_bytes().to_vec();
                        prefix.push(b'/');
                        prefix
                    }
                    None => Vec::new(),
                };
                Route {
                    backend: rule.backend,
                    db: head.to_string(),
                    prefix,
                }
            }
        };
        validate_db_name(&route.db)?;
        Ok(route)
    }

    /// Returns the partition instance (`<group>-<epoch>`) names of a
    /// partitioned group up to (exclusive) `epoch`.
    pub fn partitions_below(&self, group: &str, epoch: u32) -> Vec<String> {
        (0..epoch).map(|e| format!("{group}-{e}")).collect()
    }

    /// Returns the backend kind serving a physical database name, used
    /// when re-opening databases discovered on disk.
    pub fn backend_for_db(&self, db: &str) -> Option<BackendKind> {
        for rule in &self.rules {
            if rule.shared_db == Some(db) {
                return Some(rule.backend);
            }
            if rule.shared_db.is_none() && Self::matches(rule, db) {
                return Some(rule.backend);
            }
        }
        None
    }

    fn matches(rule: &Rule, head: &str) -> bool {
        if !rule.partitioned {
            return head == rule.group;
        }
        match head.strip_prefix(rule.group) {
            Some(rest) => rest
                .strip_prefix('-')
                .is_some_and(|epoch| !epoch.is_empty() && epoch.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }
}

/// Rejects database names that could escape the datadir or collide with
/// reserved metadata.
pub fn validate_db_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
