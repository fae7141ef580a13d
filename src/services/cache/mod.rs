pub mod block_cache;
pub mod fetcher;

pub use block_cache::*;
pub use fetcher::*;
