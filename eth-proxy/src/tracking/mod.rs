mod chain;

pub use chain::{Block, CanonicalChain, ChainSnapshot, HeadHandle};
