pub mod backend;
pub mod device;
pub mod hashed;
pub mod local;
pub mod pool;
pub mod provider;
pub mod service;
pub mod tokenize;

pub use backend::{l2_normalize, EmbeddingBackend};
pub use hashed::HashedVectorizer;
pub use pool::masked_mean_l2;
pub use provider::ProviderHandle;
