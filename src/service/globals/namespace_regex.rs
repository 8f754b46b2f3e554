use mxbridge_core::{Result, config::registration::Namespace};
use regex::RegexSet;

/// Compiled namespace matchers split by exclusivity.
pub struct NamespaceRegex {
	pub exclusive: Option<RegexSet>,
	pub non_exclusive: Option<RegexSet>,
}

impl NamespaceRegex {
	pub fn compile(namespaces: &[Namespace]) -> Result<Self> {
		let (exclusive, non_exclusive): (Vec<_>, Vec<_>) = namespaces
			.iter()
			.partition(|ns| ns.exclusive);

		Ok(Self {
			exclusive: build_set(&exclusive)?,
			non_exclusive: build_set(&non_exclusive)?,
		})
	}

	/// Matches any namespace, exclusive or not.
	#[must_use]
	pub fn is_match(&self, heystack: &str) -> bool {
		self.is_exclusive_match(heystack)
			|| self
				.non_exclusive
				.as_ref()
				.is_some_and(|set| set.is_match(heystack))
	}

	/// Matches an exclusive namespace only.
	#[must_use]
	pub fn is_exclusive_match(&self, heystack: &str) -> bool {
		self.exclusive
			.as_ref()
			.is_some_and(|set| set.is_match(heystack))
	}
}

fn build_set(namespaces: &[&Namespace]) -> Result<Option<RegexSet>> {
	if namespaces.is_empty() {
		return Ok(None);
	}

	RegexSet::new(namespaces.iter().map(|ns| anchored(&ns.regex)))
		.map(Some)
		.map_err(Into::into)
}

/// Registration regexes are whole-string matches per the AS spec.
fn anchored(pattern: &str) -> String {
	let mut anchored = String::with_capacity(pattern.len() + 2);
	if !pattern.starts_with('^') {
		anchored.push('^');
	}
	anchored.push_str(pattern);
	if !pattern.ends_with('$') {
		anchored.push('$');
	}
	anchored
}
