pub mod event;
pub mod power_levels;

pub use event::{BridgeEvent, MemberContent, Membership, Profile, TombstoneContent};
pub use power_levels::PowerLevelsContent;
