mod builder;
mod template;

pub use builder::{CodeDriveBuilder, DriveError};
