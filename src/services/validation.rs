// src/services/validation.rs
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ValidationError;

lazy_static! {
    // Markup that would execute if a client rendered the content as HTML
    static ref UNSAFE_MARKUP: Regex =
        Regex::new(r"(?i)<\s*(script|iframe|object|embed)\b|javascript\s*:|<[^>]*\bon[a-z]+\s*=").expect("valid markup regex");
}

/// Checks message content before it is persisted and returns the trimmed text.
pub fn validate_content(content: &str, max_chars: usize) -> Result<String, ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }

    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(ValidationError::TooLong { len, max: max_chars });
    }

    // Newlines and tabs are fine; other control characters are not
    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(ValidationError::Unsafe);
    }

    if UNSAFE_MARKUP.is_match(trimmed) {
        return Err(ValidationError::Unsafe);
    }

    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_and_trims_plain_text() {
        assert_eq!(
            validate_content("  I slept badly again.\nAny tips?  ", 2000).unwrap(),
            "I slept badly again.\nAny tips?"
        );
    }

    #[test]
    fn test_rejects_empty_and_whitespace() {
        assert_eq!(validate_content("", 2000), Err(ValidationError::Empty));
        assert_eq!(validate_content(" \n\t ", 2000), Err(ValidationError::Empty));
    }

    #[test]
    fn test_length_limit_counts_characters() {
        let at_limit = "é".repeat(10);
        assert!(validate_content(&at_limit, 10).is_ok());
        assert_eq!(
            validate_content(&"a".repeat(11), 10),
            Err(ValidationError::TooLong { len: 11, max: 10 })
        );
    }

    #[test]
    fn test_rejects_markup_and_control_characters() {
        assert_eq!(validate_content("<script>alert(1)</script>", 2000), Err(ValidationError::Unsafe));
        assert_eq!(validate_content("<img src=x onerror=alert(1)>", 2000), Err(ValidationError::Unsafe));
        assert_eq!(validate_content("hi\u{0000}there", 2000), Err(ValidationError::Unsafe));
        assert!(validate_content("blood pressure < 140 and > 90", 2000).is_ok());
    }
}
