//! Content-addressed, copy-on-write object store.
//!
//! Layers a commit/tree/blob model over any [`mnemo_backend::BlobBackend`].
//! Every durable mutation produces a new commit whose tree structurally
//! shares unchanged subtrees with its parent; `refs/head` advances by
//! compare-and-swap. Remote backends get a 200 ms write buffer that
//! collapses repeated writes to the same logical path.

pub mod buffer;
pub mod codec;
pub mod digest;
pub mod object;
pub mod store;

pub use buffer::BufferConfig;
pub use codec::PayloadClass;
pub use digest::Digest;
pub use object::{CommitObject, TreeEntry, TreeObject};
pub use store::{Change, ChangeOp, CommitId, CommitOutcome, CowConfig, CowStore};
