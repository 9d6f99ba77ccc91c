mod backend;
mod error;
mod function;
mod store;
mod vm;

pub use backend::{ChunkHandler, ExecResponse, StreamChunk, VmBackend, VmClient};
pub use error::{Error, Result};
pub use function::{
    ExecMode, FunctionSpec, IsolationMode, NetRule, NetworkPolicy, ResourceLimits, VolumeMount,
};
pub use store::{FunctionCode, MetadataStore};
pub use vm::{Vm, VmState};
