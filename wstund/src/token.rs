use core::fmt;

/// Minimum number of characters in a rendez-vous token.
pub const MIN_TOKEN_LEN: usize = 16;

/// Rendez-vous token identifying one tunnel endpoint.
///
/// Tokens are opaque printable strings of at least [`MIN_TOKEN_LEN`]
/// characters. Log output must always go through [`Token::cut`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Redacted form for logs: first 8 characters followed by an ellipsis.
    pub fn cut(&self) -> String {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        format!("{}...", &self.0[..end])
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
