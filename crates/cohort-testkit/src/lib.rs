//! # Cohort Testkit
//!
//! Testing utilities for cohort.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a small replicated key-value application and recording
//!   cluster collaborators for wiring nodes in tests
//! - **Generators**: Proptest strategies for messages and exchange payloads
//!
//! ## Test Fixtures
//!
//! ```rust
//! use cohort_testkit::fixtures::{membership, KvApp};
//!
//! let app = KvApp::new();
//! let view = membership(1, &[1, 2, 3]);
//! assert_eq!(view.len(), 3);
//! assert!(app.is_empty());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cohort_testkit::generators::messages;
//!
//! proptest! {
//!     #[test]
//!     fn log_round_trip(batch in messages(32)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    membership, node, node_id, put, FlowCall, KvApp, RecordingFlowController,
    StaticFailureDetector,
};
