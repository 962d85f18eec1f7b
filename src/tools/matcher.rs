//! Anchored glob matching for collection and index name filters.
//!
//! Patterns are case-sensitive and match the whole name; `*` matches any run
//! of characters except `.`, so `users*` never spills across a namespace dot.

use anyhow::{bail, Error};
use regex::Regex;

pub struct NameMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, Error> {
        Ok(Self {
            include: include
                .iter()
                .map(|glob| glob_to_regex(glob))
                .collect::<Result<_, _>>()?,
            exclude: exclude
                .iter()
                .map(|glob| glob_to_regex(glob))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn unfiltered() -> Self {
        Self { include: Vec::new(), exclude: Vec::new() }
    }

    /// True when any include or exclude pattern is configured.
    pub fn has_filters(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    /// An empty include list admits everything; an exclude match always wins.
    pub fn matches(&self, name: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(name))
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, Error> {
    if glob.is_empty() {
        bail!("empty glob pattern");
    }
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str("[^.]*"),
            ch => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|err| anyhow::format_err!("bad glob '{}': {}", glob, err))
}

#[cfg(test)]
mod test {
    use super::*;

    fn matcher(include: &[&str], exclude: &[&str]) -> NameMatcher {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        NameMatcher::new(&include, &exclude).unwrap()
    }

    #[test]
    fn anchored_and_case_sensitive() {
        let m = matcher(&["users"], &[]);
        assert!(m.matches("users"));
        assert!(!m.matches("users_archive"));
        assert!(!m.matches("Users"));
    }

    #[test]
    fn star_does_not_cross_dots() {
        let m = matcher(&["users*"], &[]);
        assert!(m.matches("users"));
        assert!(m.matches("users_archive"));
        assert!(!m.matches("users.archive"));

        let m = matcher(&["users.*"], &[]);
        assert!(m.matches("users.archive"));
        assert!(!m.matches("users.a.b"));
    }

    #[test]
    fn exclude_wins() {
        let m = matcher(&["*"], &["orders"]);
        assert!(m.matches("users"));
        assert!(!m.matches("orders"));

        let m = matcher(&[], &["tmp_*"]);
        assert!(m.matches("users"));
        assert!(!m.matches("tmp_upload"));
    }

    #[test]
    fn empty_include_admits_all() {
        let m = NameMatcher::unfiltered();
        assert!(m.matches("anything"));
        assert!(!m.has_filters());
    }

    #[test]
    fn literal_regex_chars_are_escaped() {
        let m = matcher(&["a+b"], &[]);
        assert!(m.matches("a+b"));
        assert!(!m.matches("aab"));
    }
}
