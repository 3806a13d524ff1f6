//! Persistent storage for the TSS node.
//!
//! Two artifacts live on disk: one JSON share file per generated pool key,
//! named by the bech32 public key, and the address book mapping peer ids to
//! the multiaddrs they were last reached on.

pub mod address_book;
pub mod file_state;

pub use address_book::AddressBook;
pub use file_state::{FileStateMgr, KeygenLocalState, LocalStateManager, StorageError};
