pub mod manager;

pub use manager::{
    encoded_block_size, BlockManager, ExternalHandle, IoKind, IoRequest, IoStats, Placement,
};
