pub mod hnsw;
pub mod id_map;
pub mod index;

pub use hnsw::HnswParams;
pub use id_map::IdMap;
pub use index::AnnIndex;
