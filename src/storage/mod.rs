//! Durable JSON document storage.
//!
//! The registry and the semantic memory each persist as a single JSON
//! document. Writes are atomic (temp file, fsync, rename). Malformed
//! documents are backed up and reported so the owner can reinitialize; read
//! or write failures switch the owner to in-memory operation.
//!
//! Stores assume a single writer process. Sharing one data directory between
//! concurrently running processes is unsupported.

mod document;

pub use document::{JsonDocument, LoadOutcome, PersistenceSlot};
