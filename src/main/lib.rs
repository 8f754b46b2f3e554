//! mxbridge: a Matrix application-service bridge framework. Concrete
//! bridges implement [`BridgeController`], hand it to [`Bridge`] (usually
//! through [`Cli`]), and act on the homeserver through [`Intent`]s.

mod bridge;
mod cli;
mod logging;
mod signal;

pub use bridge::{Bridge, BridgeOpts};
pub use cli::Cli;
pub use logging::init as init_logging;
pub use mxbridge_core::{
	BridgeEvent, Config, Error, MemberContent, Membership, PowerLevelsContent, Profile, Result,
	Server,
	config::{Registration, registration},
};
pub use mxbridge_service::{
	BridgeController, Intent, RoomProvision, Services, UserProvision,
	appservice::{BridgeInfo, BridgeInfoItem},
	controller,
	intent::CreateRoomOpts,
	store,
};
