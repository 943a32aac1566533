//! Host metadata shared by the nodeprep agent.
//!
//! Parses the small `KEY=VALUE` files a node carries about itself (the
//! os-release record, the update channel configuration, and systemd
//! environment files) and orders OS image versions.

pub mod env_file;
pub mod error;
pub mod os_release;
pub mod os_version;

pub use error::{CommonError, Result};
