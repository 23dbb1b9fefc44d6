//! The server spanning tree.
//!
//! One [`NodeEntry`] per known remote server, owned by [`Topology`] in a
//! name → entry arena. Parents are not stored; the downlink sets are the
//! only edges, and every entry's `hops` is fixed to its parent's plus one at
//! insertion. Removal (netsplit) always takes the whole subtree with it so
//! the arena and the downlink sets never disagree.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

/// Tracked state for one remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Distance from the root server.
    pub hops: u32,
    /// Probes sent and not yet answered.
    pub probes: u32,
    /// Local client count; `None` until the first population reply.
    pub users: Option<u32>,
    /// When this server last answered a probe or population query.
    pub last_reply: Option<DateTime<Utc>>,
    /// When this server last reported a local client connect or exit.
    pub last_conn: Option<DateTime<Utc>>,
    /// Direct children, sorted.
    pub downlinks: BTreeSet<String>,
}

impl NodeEntry {
    fn new(hops: u32) -> Self {
        NodeEntry {
            hops,
            probes: 0,
            users: None,
            last_reply: None,
            last_conn: None,
            downlinks: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("unknown server {0}")]
    UnknownNode(String),
    #[error("listing names unknown uplink {0}")]
    UnknownParent(String),
    #[error("root already registered as {0}")]
    AlreadyRegistered(String),
}

/// The tree of known servers. Empty until [`Topology::register`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    root: Option<String>,
    nodes: HashMap<String, NodeEntry>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Seed the tree with our uplink server at hops 0.
    ///
    /// Calling this twice in one session is a caller bug; the second call
    /// fails and leaves the tree untouched.
    pub fn register(&mut self, root: &str) -> Result<(), TopologyError> {
        if let Some(existing) = &self.root {
            return Err(TopologyError::AlreadyRegistered(existing.clone()));
        }
        self.root = Some(root.to_owned());
        self.nodes.insert(root.to_owned(), NodeEntry::new(0));
        Ok(())
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Merge a full `(server, uplink)` listing into the tree.
    ///
    /// Servers already tracked are skipped, so a re-listing after a netjoin
    /// augments the tree without resetting any probe counter or user count.
    /// A pair whose uplink is not yet known (the listing is expected
    /// uplink-first) aborts the whole attempt and leaves the prior tree
    /// intact.
    pub fn rebuild(&mut self, pairs: &[(String, String)]) -> Result<(), TopologyError> {
        let mut scratch = self.clone();
        for (server, uplink) in pairs {
            if scratch.nodes.contains_key(server) {
                continue;
            }
            let hops = match scratch.nodes.get(uplink) {
                Some(parent) => parent.hops + 1,
                None => return Err(TopologyError::UnknownParent(uplink.clone())),
            };
            scratch.nodes.insert(server.clone(), NodeEntry::new(hops));
            if let Some(parent) = scratch.nodes.get_mut(uplink) {
                parent.downlinks.insert(server.clone());
            }
        }
        *self = scratch;
        Ok(())
    }

    /// Every server below `name`, breadth-first, excluding `name` itself.
    /// Unknown names have no descendants.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .nodes
            .get(name)
            .map(|entry| entry.downlinks.iter().cloned().collect())
            .unwrap_or_default();
        let mut i = 0;
        while i < out.len() {
            if let Some(entry) = self.nodes.get(&out[i]) {
                out.extend(entry.downlinks.iter().cloned());
            }
            i += 1;
        }
        out
    }

    /// Drop `far` and its whole subtree after a netsplit.
    ///
    /// Returns the removed descendants (without `far` itself) for alert
    /// composition. `far` must be tracked and cannot be the root — a split
    /// notice can race the listing refresh, so callers log and drop the
    /// error rather than treating it as fatal.
    pub fn apply_split(&mut self, near: &str, far: &str) -> Result<Vec<String>, TopologyError> {
        if !self.nodes.contains_key(far) || self.root.as_deref() == Some(far) {
            return Err(TopologyError::UnknownNode(far.to_owned()));
        }
        let affected = self.descendants(far);
        if let Some(near_entry) = self.nodes.get_mut(near) {
            near_entry.downlinks.remove(far);
        }
        self.nodes.remove(far);
        for name in &affected {
            self.nodes.remove(name);
        }
        Ok(affected)
    }

    /// A local client connected to `name`. No-op until the first population
    /// reply establishes a baseline, and for untracked servers.
    pub fn record_connect(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.nodes.get_mut(name) {
            if let Some(users) = entry.users.as_mut() {
                *users += 1;
                entry.last_conn = Some(now);
            }
        }
    }

    /// A local client left `name`. Same no-op rules as [`record_connect`];
    /// the count never goes below zero.
    ///
    /// [`record_connect`]: Topology::record_connect
    pub fn record_disconnect(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.nodes.get_mut(name) {
            if let Some(users) = entry.users.as_mut() {
                *users = users.saturating_sub(1);
                entry.last_conn = Some(now);
            }
        }
    }

    /// A population reply arrived: set the authoritative count.
    pub fn record_population(
        &mut self,
        name: &str,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        let entry = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_owned()))?;
        entry.users = Some(count);
        entry.last_reply = Some(now);
        Ok(())
    }

    /// Servers with no population baseline yet, sorted.
    pub fn unknown_population(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.users.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
