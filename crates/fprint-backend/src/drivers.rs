//! Built-in driver table
//!
//! The registry resolves a manifest's `driver` key against this table.
//! Each vendor SDK gets one statically typed adapter; proprietary SDK
//! bindings live behind their own adapters and register a name here.

use std::sync::Arc;

use crate::mock::MockBackend;
use crate::Backend;

/// Instantiate the adapter for `driver`, or `None` when no adapter of
/// that name is compiled in.
pub(crate) fn create(driver: &str) -> Option<Arc<dyn Backend>> {
    match driver {
        // Virtual reader for bring-up and integration testing.
        "mock" => Some(Arc::new(MockBackend::new("mock"))),
        _ => None,
    }
}
