pub mod community;
pub mod crypto;
pub mod hyper_index;
pub mod index;
pub mod obsidian_graph;
pub mod recovery;
pub mod repo;
pub mod snapshot;
pub mod wal;

pub use hyper_index::HyperIndex;
pub use repo::{RepoError, Repository, SnapshotView};
pub use wal::{Wal, WalError};
