//! Glob matchers for policy rules. `*` spans any run of characters, `?` a
//! single one; everything else is literal. Matches are anchored.

use regex::Regex;

use crate::Result;

#[derive(Clone, Debug)]
pub struct Glob {
	raw: String,
	re: Regex,
}

impl Glob {
	pub fn new(pattern: &str) -> Result<Self> {
		let mut re = String::with_capacity(pattern.len() + 2);
		re.push('^');
		for c in pattern.chars() {
			match c {
				| '*' => re.push_str(".*"),
				| '?' => re.push('.'),
				| c => re.push_str(&regex::escape(&c.to_string())),
			}
		}
		re.push('$');

		Ok(Self { raw: pattern.to_owned(), re: Regex::new(&re)? })
	}

	#[inline]
	#[must_use]
	pub fn matches(&self, haystack: &str) -> bool { self.re.is_match(haystack) }

	#[inline]
	#[must_use]
	pub fn pattern(&self) -> &str { &self.raw }

	/// Whether the pattern contains no wildcards at all.
	#[must_use]
	pub fn is_literal(&self) -> bool { !self.raw.contains(['*', '?']) }
}

#[cfg(test)]
mod tests {
	use super::Glob;

	#[test]
	fn star_spans_anything() {
		let g = Glob::new("@spam*:*.example.org").unwrap();
		assert!(g.matches("@spammer123:abuse.example.org"));
		assert!(!g.matches("@user:abuse.example.org"));
		assert!(!g.matches("@spammer:example.org"));
	}

	#[test]
	fn question_mark_is_single_char() {
		let g = Glob::new("bad?.example").unwrap();
		assert!(g.matches("bad1.example"));
		assert!(!g.matches("bad12.example"));
	}

	#[test]
	fn matches_are_anchored_and_escaped() {
		let g = Glob::new("example.org").unwrap();
		assert!(g.matches("example.org"));
		assert!(!g.matches("example!org"));
		assert!(!g.matches("sub.example.org"));
		assert!(g.is_literal());
	}
}
