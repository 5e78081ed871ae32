use std::fmt;

use serde::{Deserialize, Serialize};

use super::TopicError;

const MAX_LEN: usize = 65_535;

/// A concrete, wildcard-free topic a publisher addresses an event to.
///
/// Validated once at construction time; every other operation on a
/// `TopicName` is infallible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicName(String);

impl TopicName {
    pub fn new(value: impl Into<String>) -> Result<Self, TopicError> {
        let value = value.into();
        validate(&value, TopicError::EmptyName, TopicError::NameTooLong)?;
        if value.contains('#') || value.contains('+') {
            return Err(TopicError::InvalidName(value));
        }
        Ok(TopicName(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// `true` for names starting with `$`, e.g. `$SYS/session`.
    pub fn is_server_specific(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TopicName {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TopicName::new(value)
    }
}

impl From<TopicName> for String {
    fn from(name: TopicName) -> Self {
        name.0
    }
}

pub(super) fn validate(
    value: &str,
    on_empty: TopicError,
    on_too_long: TopicError,
) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(on_empty);
    }
    if value.len() > MAX_LEN {
        return Err(on_too_long);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert!(matches!(TopicName::new(""), Err(TopicError::EmptyName)));
    }

    #[test]
    fn rejects_wildcards() {
        assert!(TopicName::new("a/+/b").is_err());
        assert!(TopicName::new("a/#").is_err());
    }

    #[test]
    fn rejects_oversized() {
        let huge = "a".repeat(MAX_LEN + 1);
        assert!(matches!(TopicName::new(huge), Err(TopicError::NameTooLong)));
    }

    #[test]
    fn accepts_server_specific() {
        let name = TopicName::new("$SYS/session").unwrap();
        assert!(name.is_server_specific());
    }

    #[test]
    fn accepts_plain_name() {
        let name = TopicName::new("todos/42").unwrap();
        assert!(!name.is_server_specific());
        assert_eq!(name.segments().collect::<Vec<_>>(), vec!["todos", "42"]);
    }
}
