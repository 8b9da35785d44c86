//! Tally – the storage core of a self-hosted analytics collector for
//! multiplayer game servers.
//!
//! The collector's web dashboard and command surface are thin glue; the
//! interesting engineering lives here:
//! * a dialect-portable SQL builder that renders one declarative schema
//!   for two incompatible engines,
//! * typed statement primitives ([`statement::Executable`],
//!   [`statement::Query`]) that keep raw cursors out of caller hands,
//! * an all-or-nothing unit of work ([`transaction::Transaction`]) with
//!   distinct fatal/recoverable failure semantics,
//! * a patch engine ([`patch::PatchEngine`]) of version-ordered,
//!   idempotent, self-checking schema corrections applied once at boot,
//! * and three cooperating caches (`cache`) that keep a single embedded
//!   database responsive under continuous background write load.
//!
//! ## Modules
//! * [`dialect`] – [`dialect::Dialect`] capability set and the fluent
//!   `CREATE TABLE` builder.
//! * [`schema`] – table/column name constants and declarative
//!   [`schema::TableSpec`]s, the stable on-disk contract.
//! * [`statement`] – parameter binding and result decoding.
//! * [`transaction`] – units of work, ordinary and critical.
//! * [`patch`] – the migration engine and the shipped patches.
//! * [`system`] – the [`system::DatabaseSystem`] façade owning the
//!   connection, the caches, and the background threads.
//! * [`cache`] – response, inspection, and write-back session caches.
//! * [`filestore`] – the file-backed response cache variant.
//! * [`config`] – layered configuration via file and environment.
//! * [`error`] – the crate-wide error taxonomy.
//!
//! ## Quick Start
//! ```
//! use tally::config::StorageConfig;
//! use tally::system::DatabaseSystem;
//!
//! let mut system = DatabaseSystem::enable(StorageConfig::in_memory()).unwrap();
//! assert!(system.register_server("server-uuid", "lobby").unwrap());
//! assert!(system.register_player("player-uuid", "Alice").unwrap());
//! system.session_cache().start_session("player-uuid", "server-uuid").unwrap();
//! system.disable().unwrap();
//! ```
//!
//! ## Failure semantics
//! Enable-time failures (engine cannot open, schema creation fails) are
//! fatal and abort startup with [`error::TallyError::Fatal`]. Steady-state
//! write failures roll back, log, and surface as a false success flag so
//! the caller can retry on its own schedule.

pub mod cache;
pub mod config;
pub mod dialect;
pub mod error;
pub mod filestore;
pub mod patch;
pub mod schema;
pub mod statement;
pub mod system;
pub mod transaction;
