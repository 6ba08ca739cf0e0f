//! Token types flowing from an analyzer into the inverter.

use serde::{Deserialize, Serialize};

/// A single analyzed token.
///
/// Offsets are byte offsets into the field value the token came from. The
/// inverter places a token `position_increment` positions after the previous
/// one; an increment of 0 stacks the token on the previous position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The text content of the token.
    pub text: String,

    /// Byte offset where the token starts.
    pub start_offset: usize,

    /// Byte offset just past the token's end.
    pub end_offset: usize,

    /// Position relative to the previous token (default: 1).
    pub position_increment: u32,
}

impl Token {
    /// Create a token with a position increment of 1.
    pub fn new<S: Into<String>>(text: S, start_offset: usize, end_offset: usize) -> Self {
        Token {
            text: text.into(),
            start_offset,
            end_offset,
            position_increment: 1,
        }
    }

    /// Override the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// A stream of tokens for one field value, exhausted once.
pub type TokenStream = Box<dyn Iterator<Item = Token> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_builder() {
        let token = Token::new("cat", 4, 7);
        assert_eq!(token.position_increment, 1);

        let stacked = token.clone().with_position_increment(0);
        assert_eq!(stacked.position_increment, 0);
        assert_eq!(stacked.text, "cat");
        assert_eq!((stacked.start_offset, stacked.end_offset), (4, 7));
    }
}
