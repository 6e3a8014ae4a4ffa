//! coffer-storage: object-store sessions over OpenDAL + local chunk cache

pub mod cache;
pub mod health;
pub mod object_store;
pub mod operator;

pub use cache::ChunkCache;
pub use health::check_health;
pub use object_store::{ObjectStore, OpendalObjectStore, StoredObject, UploadTarget};
pub use operator::{build_from_core_config, build_operator, memory_operator, S3Config};
