// Exchange cache
//
// Names of exchanges already confirmed on the broker for the current link.
// Cleared on every disconnect and reconnect; no other eviction.

use std::collections::HashSet;

/// Set of exchange names known to exist on the broker
#[derive(Debug, Default, Clone)]
pub struct ExchangeCache {
    names: HashSet<String>,
}

impl ExchangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn add(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn remove(&mut self, name: &str) {
        self.names.remove(name);
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
