//! Session persistence for resume capability.

pub mod backend;
pub mod file;
pub mod memory;
pub mod noop;

pub use backend::{validate_job_id, SessionStore};
pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use noop::NoOpSessionStore;
