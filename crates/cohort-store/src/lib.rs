//! # Cohort Store
//!
//! Persistence pieces of cohort: the transient message-log file format used to
//! ship buffered group messages to a joining node, the message serializer it
//! relies on, and the [`StateStore`] abstraction that keeps periodic group
//! snapshots.
//!
//! ## Key Types
//!
//! - [`MessageLogCodec`] - Writes and reads CRC-protected message log files
//! - [`MessageSerializer`] - Black-box message encoding; [`CborSerializer`] is the default
//! - [`StateStore`] - Async trait for group snapshot persistence
//! - [`SqliteStateStore`] - SQLite-based snapshot storage
//! - [`MemoryStateStore`] - In-memory snapshot storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cohort_store::{CborSerializer, MessageLogCodec};
//!
//! let codec = MessageLogCodec::new(Arc::new(CborSerializer));
//! // codec.save(&messages, "bundle-0001.log")?;
//! // let replay = codec.load("bundle-0001.log")?;
//! ```
//!
//! ## Log File Format
//!
//! ```text
//! [u16 magic = 0x1717][u32 length][u32 count][u32 crc32][payload: length bytes]
//! ```
//!
//! All integers are big-endian. The payload is `count` frames of
//! `[u32 length][serialized message]`.

pub mod codec;
pub mod error;
pub mod log;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use codec::{CborSerializer, MessageSerializer};
pub use error::{Result, StoreError};
pub use log::{MessageLogCodec, MessageLogHeader, HEADER_SIZE, MAGIC};
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;
pub use traits::StateStore;
