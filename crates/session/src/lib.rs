//! Session-log backends for Blade.
//!
//! Every backend implements `blade_core::SessionLog`: an append-only,
//! per-session sequence of stamped events.

pub mod file_backend;
pub mod in_memory;
pub mod noop;

pub use file_backend::JsonlSessionLog;
pub use in_memory::InMemorySessionLog;
pub use noop::NoopSessionLog;
