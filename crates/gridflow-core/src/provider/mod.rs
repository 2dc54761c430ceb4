//! External collaborator ports.
//!
//! The engine talks to the outside world through three narrow traits:
//! document retrieval, analysis, and export file writing. Each is declared
//! with native async fns for implementors plus an object-safe `*Dyn`
//! counterpart (boxed futures, blanket impl) so executors can share them as
//! `Arc<dyn ...>` across worker tasks.

pub mod analysis;
pub mod document;
pub mod export;
