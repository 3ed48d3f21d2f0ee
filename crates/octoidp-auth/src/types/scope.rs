//! Space-delimited OAuth scope sets.

use std::fmt;

/// An ordered, de-duplicated set of scope tokens.
///
/// Order of first appearance is preserved so the scope echoed back to a
/// client reads the way it was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope(Vec<String>);

impl Scope {
    /// Parses a space-delimited scope string. Repeated tokens are dropped.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for token in value.split_ascii_whitespace() {
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        Self(tokens)
    }

    /// Returns `true` if there are no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if the token is present.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|t| t == token)
    }

    /// Returns `true` if every token of `self` is present in `granted`.
    #[must_use]
    pub fn is_subset_of(&self, granted: &Scope) -> bool {
        self.0.iter().all(|t| granted.contains(t))
    }

    /// Returns the tokens of `self` that are also in `other`, in `self`'s order.
    #[must_use]
    pub fn intersect(&self, other: &Scope) -> Scope {
        Self(
            self.0
                .iter()
                .filter(|t| other.contains(t))
                .cloned()
                .collect(),
        )
    }

    /// Iterates over the tokens.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}
