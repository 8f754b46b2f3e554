//! Homeserver access for the bridge. `Homeserver` is the seam every
//! component programs against; `MatrixClient` is the reqwest-backed
//! implementation speaking the client-server API with appservice identity
//! assertion.

mod homeserver;
mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod response;

pub use homeserver::Homeserver;
pub use http::MatrixClient;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockHomeserver;
pub use response::{
	MediaDownload, PresenceStatus, RegisterProbe, SyncJoinedRoom, SyncResponse, SyncRooms,
	SyncTimeline, WhoisInfo, WhoisSession,
};
