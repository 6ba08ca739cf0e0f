//! Analyzer trait and the built-in analyzers.

use crate::analysis::token::{Token, TokenStream};
use crate::error::Result;

/// Converts a field value into tokens.
///
/// Implementations must be cheap to call repeatedly; the writer calls
/// [`Analyzer::token_stream`] once per tokenized field instance.
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Analyze `text`, the value of field `field`.
    fn token_stream(&self, field: &str, text: &str) -> Result<TokenStream>;

    /// Short name of the analyzer, used in logs.
    fn name(&self) -> &'static str;
}

/// Splits on Unicode whitespace. Tokens keep their case.
#[derive(Clone, Debug, Default)]
pub struct WhitespaceAnalyzer;

impl WhitespaceAnalyzer {
    pub fn new() -> Self {
        WhitespaceAnalyzer
    }
}

impl Analyzer for WhitespaceAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let mut tokens = Vec::new();
        let mut start = None;

        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                if let Some(s) = start.take() {
                    tokens.push(Token::new(&text[s..i], s, i));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            tokens.push(Token::new(&text[s..], s, text.len()));
        }

        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

/// Emits the entire value as a single token.
#[derive(Clone, Debug, Default)]
pub struct KeywordAnalyzer;

impl KeywordAnalyzer {
    pub fn new() -> Self {
        KeywordAnalyzer
    }
}

impl Analyzer for KeywordAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Result<TokenStream> {
        if text.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(std::iter::once(Token::new(text, 0, text.len()))))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_analyzer() {
        let analyzer = WhitespaceAnalyzer::new();
        let tokens: Vec<Token> = analyzer
            .token_stream("body", "  the cat\tsat\n")
            .unwrap()
            .collect();

        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["the", "cat", "sat"]);
        assert_eq!((tokens[0].start_offset, tokens[0].end_offset), (2, 5));
        assert_eq!((tokens[2].start_offset, tokens[2].end_offset), (10, 13));
    }

    #[test]
    fn test_whitespace_analyzer_multibyte() {
        let analyzer = WhitespaceAnalyzer::new();
        let tokens: Vec<Token> = analyzer.token_stream("f", "café au").unwrap().collect();
        assert_eq!(tokens[0].text, "café");
        assert_eq!(tokens[0].end_offset, "café".len());
        assert_eq!(tokens[1].start_offset, "café ".len());
    }

    #[test]
    fn test_keyword_analyzer() {
        let analyzer = KeywordAnalyzer::new();
        let tokens: Vec<Token> = analyzer
            .token_stream("id", "Hello World Test")
            .unwrap()
            .collect();

        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "Hello World Test");
        assert_eq!(analyzer.token_stream("id", "").unwrap().count(), 0);
    }
}
