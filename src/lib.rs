//! Client library for a geo-distributed object store.
//!
//! Applications create, read, write and seal named objects addressed by
//! `(bucket, key)`. A metadata service tracks object descriptors, durable
//! content lives in an object backend, and a process-wide block cache keeps
//! hot ranges local with safe concurrent access.

pub mod backend;
pub mod cache;
pub mod error;
pub mod file;
pub mod layout;
pub mod meta;
pub mod session;

pub use error::{Result, StoreError};
pub use file::FileHandle;
pub use layout::BlockLayout;
pub use meta::{ObjectDescriptor, ObjectId, ObjectStatus, SealState};
pub use session::{Session, SessionConfig};
