//! Order dispatch records
//!
//! This module provides the records exchanged between the dispatch core and
//! the surrounding platform:
//! - Orders and their delivery status machine
//! - Couriers (riders) and their availability
//! - Timeout kinds and location samples

pub mod types;

// Re-exports
pub use types::*;
