//! In-memory view of the peer address book.
//!
//! The transport layer records addresses as connections are established;
//! the server flushes the book through a [`LocalStateManager`] so the next
//! boot can dial previously-known peers in addition to the configured
//! bootstrap set.

use std::collections::HashMap;

use crate::file_state::{LocalStateManager, StorageError};

/// Peer id string → multiaddr strings last seen for that peer.
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    entries: HashMap<String, Vec<String>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the book a previous run left behind.
    pub fn load(mgr: &dyn LocalStateManager) -> Result<Self, StorageError> {
        Ok(Self {
            entries: mgr.retrieve_address_book()?,
        })
    }

    /// Record an address for a peer; duplicates are ignored.
    pub fn record(&mut self, peer_id: &str, addr: &str) -> bool {
        let addrs = self.entries.entry(peer_id.to_string()).or_default();
        if addrs.iter().any(|a| a == addr) {
            return false;
        }
        addrs.push(addr.to_string());
        true
    }

    /// Every known multiaddr, for seeding the bootstrap dial list.
    pub fn all_addresses(&self) -> Vec<String> {
        self.entries.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self, mgr: &dyn LocalStateManager) -> Result<(), StorageError> {
        mgr.save_address_book(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_state::FileStateMgr;

    #[test]
    fn test_record_deduplicates() {
        let mut book = AddressBook::new();
        assert!(book.record("peer1", "/ip4/10.0.0.1/tcp/1"));
        assert!(!book.record("peer1", "/ip4/10.0.0.1/tcp/1"));
        assert!(book.record("peer1", "/ip4/10.0.0.2/tcp/1"));
        assert_eq!(book.all_addresses().len(), 2);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();

        let mut book = AddressBook::new();
        book.record("peer1", "/ip4/10.0.0.1/tcp/1");
        book.flush(&mgr).unwrap();

        let reloaded = AddressBook::load(&mgr).unwrap();
        assert_eq!(reloaded.all_addresses(), vec!["/ip4/10.0.0.1/tcp/1"]);
    }
}
