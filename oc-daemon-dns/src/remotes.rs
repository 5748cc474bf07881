//! Mapping from DNS name suffixes to upstream servers

use parking_lot::RwLock;
use std::collections::HashMap;

/// Normalizes a DNS name to lowercase with a trailing dot.
pub(crate) fn normalize(name: &str) -> String {
    let mut n = name.to_lowercase();
    if !n.ends_with('.') {
        n.push('.');
    }
    n
}

/// Mapping from DNS name suffixes to upstream DNS servers. Lookups walk the
/// question name label by label; the longest matching suffix wins and the
/// entry for "." is the catch-all.
pub struct Remotes {
    m: RwLock<HashMap<String, Vec<String>>>,
}

impl Remotes {
    /// Creates an empty remotes table.
    pub fn new() -> Self {
        Self {
            m: RwLock::new(HashMap::new()),
        }
    }

    /// Removes all entries.
    pub fn flush(&self) {
        self.m.write().clear();
    }

    /// Adds upstream servers for a name suffix. An empty domain registers
    /// the catch-all entry.
    pub fn add(&self, domain: &str, servers: Vec<String>) {
        if servers.is_empty() {
            return;
        }
        self.m.write().insert(normalize(domain), servers);
    }

    /// Returns the upstream servers responsible for name.
    pub fn get(&self, name: &str) -> Vec<String> {
        let name = normalize(name);
        let m = self.m.read();

        let mut rest = name.as_str();
        loop {
            if let Some(servers) = m.get(rest) {
                return servers.clone();
            }
            match rest.split_once('.') {
                Some((_, tail)) if !tail.is_empty() => rest = tail,
                _ => break,
            }
        }
        m.get(".").cloned().unwrap_or_default()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.m.read().len()
    }

    /// Reports whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.m.read().is_empty()
    }
}

impl Default for Remotes {
    fn default() -> Self {
        Self::new()
    }
}
