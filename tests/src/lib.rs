//! # Ride Dispatch Test Suite
//!
//! Cross-crate flows run against the in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── flows.rs      # publish → route → relay → push, match waiting
//!     └── reconnect.rs  # broker drops, redelivery, push replay
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p rh-tests
//! cargo test -p rh-tests integration::reconnect::
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
