mod api;
mod backend_impl;
mod command;
mod config;
mod drive;
mod manager;
mod network;
mod paths;
mod prerequisites;
mod resources;
mod snapshot;

pub use backend_impl::FirecrackerBackend;
pub use config::FirecrackerConfig;
pub use drive::{CodeDriveBuilder, DriveError};
pub use manager::{VmEvent, VmManager};
pub use resources::ResourcePool;
pub use snapshot::{SnapshotMeta, SnapshotStore};
