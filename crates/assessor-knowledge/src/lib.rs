//! Persistence layer for the assessor
//!
//! This crate provides:
//! - A shared SQLite handle with the full schema
//! - The task/alert/employee ledger
//! - The per-session long-term memory log
//! - The Q&A knowledge base with embedding similarity search

pub mod ledger;
pub mod memory;
pub mod sqlite;
pub mod vector;

// Re-export main types
pub use ledger::{
    AlertRecord, Employee, Ledger, LedgerError, LedgerResult, NewAlert, NewTask, ReferenceKind, TaskFilter,
    TaskRecord,
};
pub use memory::{MemoryRecord, MemoryStore, MemoryStoreError, SqliteMemoryStore};
pub use sqlite::{DbError, KnowledgeDb};
pub use vector::{
    DEFAULT_TOP_K, Embedder, GoogleEmbedder, KnowledgeRetriever, QaHit, QaPair, RetrievalError, format_hits,
    normalize,
};
