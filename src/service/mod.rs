mod service;
pub mod services;

pub mod activity;
pub mod appservice;
pub mod ban_sync;
pub mod blocker;
pub mod controller;
pub mod encryption;
pub mod globals;
pub mod intent;
pub mod link_validator;
pub mod media_proxy;
pub mod membership_cache;
pub mod membership_queue;
pub mod room_upgrade;
pub mod service_room;
pub mod state_lookup;
pub mod store;
pub mod user_activity;

pub(crate) use service::{Args, Service};

pub use crate::{
	controller::{BridgeController, RoomProvision, UserProvision},
	intent::Intent,
	services::Services,
};

#[cfg(test)]
pub(crate) mod test_utils;
