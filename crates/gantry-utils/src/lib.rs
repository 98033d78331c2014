mod shard;

pub use shard::{Fnv32Hash, ShardHash, ShardMap};
