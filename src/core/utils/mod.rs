pub mod cache;
pub mod defer;
pub mod glob;
pub mod rand;
pub mod result;
pub mod time;

pub use self::{
	cache::RequestCache,
	defer::Defer,
	glob::Glob,
	rand::string as random_string,
	result::{LogErr, Result},
	time::now_millis as millis_since_unix_epoch,
};

#[inline]
pub fn exchange<T>(state: &mut T, source: T) -> T { std::mem::replace(state, source) }
