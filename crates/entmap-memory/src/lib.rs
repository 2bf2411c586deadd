//! In-memory storage backend for entmap.
//!
//! `MemoryStorage` keeps every table in process memory and implements the
//! full [`entmap_core::Storage`] contract: auto-increment keys, NOT NULL,
//! type, primary key and foreign key checks, transactions with rollback,
//! and fault injection for exercising flush failure paths.

mod storage;
mod table;

pub use storage::MemoryStorage;
