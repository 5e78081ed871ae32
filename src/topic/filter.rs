use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{name::validate, TopicError, TopicName};

fn grammar() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(([^+#]*|\+)(/([^+#]*|\+))*(/#)?|#)$").unwrap())
}

/// A subscriber-side topic expression, possibly containing `+` and `#`
/// wildcards, matched against concrete [`TopicName`]s.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(value: impl Into<String>) -> Result<Self, TopicError> {
        let value = value.into();
        validate(&value, TopicError::EmptyFilter, TopicError::FilterTooLong)?;
        if !grammar().is_match(&value) {
            return Err(TopicError::InvalidFilter(value));
        }
        Ok(TopicFilter(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segment-by-segment match against `name`, per the `$`-prefix guard
    /// (rule A), the normal first segment (rule B), and the walk over
    /// subsequent segments (rule C).
    pub fn matches(&self, name: &TopicName) -> bool {
        let mut name_segments = name.segments();
        let mut filter_segments = self.0.split('/');

        let first_name = name_segments.next().unwrap_or("");
        let first_filter = filter_segments.next().unwrap_or("");

        if name.is_server_specific() {
            if first_filter != first_name {
                return false;
            }
        } else {
            match first_filter {
                "#" => return true,
                "+" => {}
                literal if literal == first_name => {}
                _ => return false,
            }
        }

        loop {
            match (filter_segments.next(), name_segments.next()) {
                (None, None) => return true,
                (Some("#"), _) => return true,
                (Some(_), None) => return false,
                (None, Some(_)) => return false,
                (Some("+"), Some(_)) => continue,
                (Some(f), Some(n)) if f == n => continue,
                (Some(_), Some(_)) => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TopicFilter::new(value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> TopicName {
        TopicName::new(s).unwrap()
    }

    fn f(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(TopicFilter::new("").is_err());
        assert!(TopicFilter::new("a/#/b").is_err());
        assert!(TopicFilter::new("a#b").is_err());
        assert!(TopicFilter::new("a+b").is_err());
    }

    #[test]
    fn hash_matches_everything_except_dollar() {
        assert!(f("#").matches(&n("todos/42")));
        assert!(f("#").matches(&n("a")));
        assert!(!f("#").matches(&n("$SYS/session")));
    }

    #[test]
    fn dollar_sys_hash_matches_only_dollar_sys() {
        assert!(f("$SYS/#").matches(&n("$SYS/monitor/Clients")));
        assert!(f("$SYS/#").matches(&n("$SYS")));
        assert!(!f("$SYS/#").matches(&n("other/topic")));
    }

    #[test]
    fn plus_matches_single_segment() {
        assert!(f("sport/+/player1").matches(&n("sport/tennis/player1")));
        assert!(!f("sport/+/player1").matches(&n("sport/tennis/clay/player1")));
    }

    #[test]
    fn trailing_hash_matches_suffix() {
        assert!(f("sport/tennis/#").matches(&n("sport/tennis/player1")));
        assert!(f("sport/tennis/#").matches(&n("sport/tennis")));
        assert!(!f("sport/tennis/#").matches(&n("sport/badminton")));
    }

    #[test]
    fn literal_segments_must_match_exactly() {
        assert!(f("a/b/c").matches(&n("a/b/c")));
        assert!(!f("a/b/c").matches(&n("a/b/d")));
        assert!(!f("a/b/c").matches(&n("a/b")));
        assert!(!f("a/b").matches(&n("a/b/c")));
    }

    #[test]
    fn dollar_prefixed_name_requires_literal_first_segment() {
        assert!(!f("+/monitor/Clients").matches(&n("$SYS/monitor/Clients")));
        assert!(f("$SYS/monitor/Clients").matches(&n("$SYS/monitor/Clients")));
    }
}
