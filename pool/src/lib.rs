mod pool;
mod singleflight;

pub use pool::{PoolConfig, PooledVm, SnapshotHook, VmPool};
pub use singleflight::Singleflight;
