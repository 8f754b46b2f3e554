pub mod config;
pub mod error;
pub mod log;
pub mod matrix;
pub mod metrics;
pub mod server;
pub mod utils;

pub use ::http;
pub use ::ruma;
pub use ::tracing;
pub use config::Config;
pub use error::Error;
pub use log::{debug, error, info, trace, warn};
pub use matrix::{
	BridgeEvent, MemberContent, Membership, PowerLevelsContent, Profile, TombstoneContent,
};
pub use server::Server;
pub use utils::result::Result;

pub use crate as mxbridge_core;
