//! Storage layer of the micra runtime: the config center with its
//! local-file and remote-store modes, and the shared `KvStore`
//! surface that the cluster coordinator and the standalone naming
//! registry coordinate through.

pub mod config_center;
pub mod kv;
pub mod memory;
pub mod store;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use config_center::{ConfigCenter, ConfigContent};
pub use kv::KvStore;
pub use memory::MemoryKvStore;
pub use store::{ConfigStore, KvConfigStore};
