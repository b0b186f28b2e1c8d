//! # Harbor Engine
//!
//! The deterministic core of an offline-first client data layer.
//!
//! This crate holds everything that decides *what* the client shows and
//! sends: the query cache, the mutation queue, optimistic updates and their
//! rollback, and conflict resolution. It never touches the network, the disk
//! or the system clock, so the same inputs always produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: callers pass gateway results, the current time and a random
//!   source in; state comes out as values to persist
//! - **Deterministic**: time comes from a [`Clock`], jitter from a caller's `Rng`
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Queries
//!
//! A [`QueryKey`] is an ordered tuple of primitives. Structurally equal keys
//! address the same [`CacheEntry`]. Entries are served stale-while-revalidate.
//!
//! ### Mutations
//!
//! Writes are typed [`Mutation`] variants. Each one is applied to the cache
//! right away through a pure reducer, then queued as a [`MutationRecord`]
//! with a UUID idempotency key until the server confirms it.
//!
//! ### Conflicts
//!
//! When the server reports that a record moved on, the
//! [`conflict`](crate::conflict) resolver merges field by field; the server
//! wins on overlapping fields and the user is told which ones.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{detail_key, EntityKind, Mutation, MutationAck, Store};
//! use rand::SeedableRng;
//! use serde_json::json;
//!
//! let mut store = Store::default();
//! store.set_online(true);
//!
//! // 1. Cache a server record
//! let key = detail_key(EntityKind::Client, "c1");
//! let ticket = store.begin_fetch(&key, 0).unwrap();
//! store.finish_fetch(&ticket, Ok(json!({"id": "c1", "name": "Jane", "version": 1})), 0);
//!
//! // 2. Rename optimistically
//! let changes = json!({"name": "Jane B"}).as_object().cloned().unwrap();
//! let rename = Mutation::Update {
//!     kind: EntityKind::Client,
//!     id: "c1".into(),
//!     base_version: 1,
//!     changes,
//! };
//! store.mutate(rename, 1).unwrap();
//! assert_eq!(store.view(&key, 1).data.unwrap()["name"], "Jane B");
//!
//! // 3. Deliver and commit
//! let record = store.next_batch(1).unwrap().remove(0);
//! let ack = MutationAck::new(json!({"id": "c1", "name": "Jane B", "version": 2}));
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! store.complete(record.id, Ok(ack), 2, &mut rng).unwrap();
//! assert_eq!(store.sync_state().pending_count, 0);
//! ```
//!
//! ## Persistence
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with
//! [`PersistedState`]. The document serializes to JSON with deterministic
//! ordering.

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod key;
pub mod mutation;
pub mod notice;
pub mod optimistic;
pub mod queue;
pub mod reducer;
pub mod remote;
pub mod scheduler;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use cache::{
    CacheConfig, CacheEntry, FetchTicket, Observer, QueryCache, QueryStatus, QueryView,
    SubscriptionId,
};
pub use clock::{Clock, ManualClock};
pub use conflict::Resolution;
pub use error::Error;
pub use key::{detail_key, list_key, notes_for_client_key, KeyPart, QueryDescriptor, QueryKey};
pub use mutation::{
    FailureKind, FieldMap, Mutation, MutationKind, MutationRecord, MutationStatus, Touched,
};
pub use notice::{Notice, NoticeKind};
pub use queue::{MutationQueue, QueueConfig, RetryDecision};
pub use remote::{Disposition, GatewayError, MutationAck};
pub use scheduler::Scheduler;
pub use schema::{EntityKind, EntitySchema, FieldDef, FieldError, FieldType, Schema};
pub use snapshot::{PersistedState, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use store::{PushOutcome, Store, StoreConfig, SyncOutcome, SyncState};

/// Type aliases for clarity
pub type RecordId = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type MutationId = uuid::Uuid;
