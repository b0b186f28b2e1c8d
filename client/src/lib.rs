//! # Harbor Client
//!
//! The async runtime around [`harbor_engine`]: a remote gateway, durable
//! storage behind a single writer, connectivity tracking and the sync loop
//! that delivers queued mutations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use harbor_client::{Config, MemoryGateway, SyncContext};
//! use harbor_engine::{detail_key, EntityKind};
//!
//! # async fn demo() {
//! let gateway = MemoryGateway::new_shared();
//! let context = SyncContext::init(Config::default(), gateway).await;
//! context.set_online(true);
//!
//! let query = context.use_query(detail_key(EntityKind::Client, "c1"));
//! println!("{:?}", query.view());
//!
//! context.shutdown().await.ok();
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod network;
pub mod persistence;

pub use clock::SystemClock;
pub use config::{Config, ConfigError};
pub use context::{MutationHandle, MutationState, QueryHandle, SyncContext};
pub use coordinator::SyncCoordinator;
pub use error::{ClientError, PersistenceError, Result};
pub use gateway::{Gateway, PushHandler, Subscription};
pub use memory::{Fault, MemoryGateway};
pub use network::NetworkMonitor;
pub use persistence::{FileStore, MemoryStore, PersistWriter, PersistentStore};
