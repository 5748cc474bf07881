//! Watched DNS names for A/AAAA reporting

use crate::remotes::normalize;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Maximum number of temporary watch entries. Beyond this the least
/// recently added entry is evicted.
const MAX_TEMP: usize = 10_000;

struct Inner {
    /// Permanent watches, matched as name suffixes.
    domains: HashSet<String>,
    /// Temporary watches learned from CNAME/DNAME targets, with expiry.
    temps: HashMap<String, Instant>,
    /// Insertion order of temporary watches, oldest first.
    order: VecDeque<String>,
}

/// Set of watched DNS names. A name is watched when it or any of its
/// parent domains is in the permanent set or in the temporary set seeded
/// by CNAME/DNAME targets observed in answers.
pub struct Watches {
    inner: Mutex<Inner>,
}

impl Watches {
    /// Creates an empty watch set.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                domains: HashSet::new(),
                temps: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Removes all permanent and temporary watches.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.domains.clear();
        inner.temps.clear();
        inner.order.clear();
    }

    /// Adds a permanent watch for a name suffix.
    pub fn add(&self, domain: &str) {
        self.inner.lock().domains.insert(normalize(domain));
    }

    /// Adds a temporary watch for a CNAME target.
    pub fn add_temp_cname(&self, target: &str, ttl: u32) {
        debug!("DNS proxy adding temporary CNAME watch for {} (ttl {})", target, ttl);
        self.add_temp(target, ttl);
    }

    /// Adds a temporary watch for a DNAME target.
    pub fn add_temp_dname(&self, target: &str, ttl: u32) {
        debug!("DNS proxy adding temporary DNAME watch for {} (ttl {})", target, ttl);
        self.add_temp(target, ttl);
    }

    fn add_temp(&self, name: &str, ttl: u32) {
        let name = normalize(name);
        let expiry = Instant::now() + Duration::from_secs(u64::from(ttl));

        let mut inner = self.inner.lock();
        if inner.temps.insert(name.clone(), expiry).is_some() {
            inner.order.retain(|n| n != &name);
        }
        inner.order.push_back(name);

        while inner.temps.len() > MAX_TEMP {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.temps.remove(&old);
                }
                None => break,
            }
        }
    }

    /// Reports whether name or any of its parent domains is watched.
    /// Expired temporary entries encountered on the way are reaped.
    pub fn contains(&self, name: &str) -> bool {
        let name = normalize(name);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut rest = name.as_str();
        loop {
            if inner.domains.contains(rest) {
                return true;
            }
            if let Some(&expiry) = inner.temps.get(rest) {
                if expiry > now {
                    return true;
                }
                let expired = rest.to_string();
                inner.temps.remove(&expired);
                inner.order.retain(|n| n != &expired);
            }
            match rest.split_once('.') {
                Some((_, tail)) if !tail.is_empty() => rest = tail,
                _ => return false,
            }
        }
    }

    /// Removes expired temporary watches.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut guard = self.inner.lock();

        let before = guard.temps.len();
        let Inner { temps, order, .. } = &mut *guard;
        temps.retain(|_, expiry| *expiry > now);
        order.retain(|n| temps.contains_key(n));

        let removed = before - temps.len();
        if removed > 0 {
            debug!("DNS proxy reaped {} expired temporary watches", removed);
        }
    }

    /// Returns the number of temporary watches.
    pub fn temp_len(&self) -> usize {
        self.inner.lock().temps.len()
    }
}

impl Default for Watches {
    fn default() -> Self {
        Self::new()
    }
}
