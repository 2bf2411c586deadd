//! entmap: an identity-map backed unit of work with explicit relationship
//! loading.
//!
//! This facade re-exports the workspace crates:
//!
//! - `entmap-core`: `Model`, `Value`, `Row`, `Storage`, `Error`
//! - `entmap-schema`: the validated entity registry and table bootstrap
//! - `entmap-session`: `Session`, identity map, change tracker, flush
//! - `entmap-memory`: the in-memory transactional backend
//!
//! and provides [`fixture`], the six-entity risk register used to check
//! that loading a relationship never disturbs unflushed scalar changes.
//!
//! # Example
//!
//! ```ignore
//! use entmap::prelude::*;
//! use entmap::fixture::{self, Cause, Risk};
//!
//! let storage = MemoryStorage::new();
//! let schema = fixture::bootstrap(&storage).await?;
//! let mut session = Session::new(storage.connect(), schema);
//! let ids = fixture::seed(&mut session).await?;
//!
//! let risk = session.get::<Risk>(ids.risk).await?;
//! session.mark_dirty(&risk, "name", "Updated")?;
//! session.load::<Risk, Cause>(&risk, "causes").await?;
//! session.flush().await?;
//! ```

pub mod fixture;

pub use entmap_core::{
    AutoIncrement, ConsistencyError, Error, FieldInfo, Filter, InvalidStateError, Model,
    NotFoundError, PersistenceError, PersistenceErrorKind, RelationshipInfo, RelationshipKind,
    Result, Row, SchemaErrorKind, Storage, Value, WriteKind,
};
pub use entmap_memory::MemoryStorage;
pub use entmap_schema::{Schema, SchemaBuilder, create_all, table_defs};
pub use entmap_session::{
    Collection, CollectionState, Entity, FlushResult, ModelRef, ObjectKey, ObjectState,
    PendingCounts, Session, SessionConfig, SessionDebugInfo,
};

/// Commonly used items.
///
/// ```ignore
/// use entmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Core traits and types
        AutoIncrement,
        Collection,
        CollectionState,
        Entity,
        Error,
        Filter,
        FlushResult,
        MemoryStorage,
        Model,
        ModelRef,
        ObjectState,
        Result,
        Row,
        Schema,
        // Session
        Session,
        SessionConfig,
        Storage,
        Value,
    };
}
