//! Asynchronous coordination primitives — single-flight jobs, named mutexes.

pub mod job;
pub mod mutex;

pub use job::AsyncJob;
pub use mutex::{NamedMutexGuard, NamedMutexes};
