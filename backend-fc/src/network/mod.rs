mod bridge;
mod netns;
mod subnet;
mod tap;

pub(crate) use bridge::ensure_bridge;
pub(crate) use netns::{setup_netns, teardown_netns};
pub(crate) use subnet::Subnet;
pub(crate) use tap::{boot_args, create_tap, delete_tap, guest_mac, tap_name};
