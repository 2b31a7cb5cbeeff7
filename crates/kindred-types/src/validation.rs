//! Input validation applied before any state is touched.

use crate::CompanionError;

/// Longest accepted message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Longest accepted session identifier, in characters.
pub const MAX_SESSION_ID_CHARS: usize = 128;

/// Trim and validate a user message.
///
/// Rejects empty text, text longer than [`MAX_MESSAGE_CHARS`], and any control
/// character other than `\n`, `\r` and `\t`.
pub fn validate_message(raw: &str) -> Result<String, CompanionError> {
    let message = raw.trim();
    if message.is_empty() {
        return Err(CompanionError::Validation("message cannot be empty".into()));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(CompanionError::Validation(format!(
            "message too long (max {MAX_MESSAGE_CHARS} characters)"
        )));
    }
    if message
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(CompanionError::Validation(
            "message contains invalid control characters".into(),
        ));
    }
    Ok(message.to_string())
}

pub(crate) fn validate_session_id(raw: &str) -> Result<(), CompanionError> {
    if raw.is_empty() {
        return Err(CompanionError::Validation("session_id cannot be empty".into()));
    }
    if raw.chars().count() > MAX_SESSION_ID_CHARS {
        return Err(CompanionError::Validation(format!(
            "session_id too long (max {MAX_SESSION_ID_CHARS} characters)"
        )));
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(CompanionError::Validation(
            "session_id may only contain [A-Za-z0-9_.:-]".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_trimmed() {
        assert_eq!(validate_message("  hi there \n").unwrap(), "hi there");
    }

    #[test]
    fn empty_or_whitespace_message_rejected() {
        assert!(validate_message("").is_err());
        assert!(validate_message(" \t\n ").is_err());
    }

    #[test]
    fn overlong_message_rejected() {
        let long = "a".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            validate_message(&long),
            Err(CompanionError::Validation(_))
        ));
        let exact = "a".repeat(MAX_MESSAGE_CHARS);
        assert!(validate_message(&exact).is_ok());
    }

    #[test]
    fn control_characters_rejected_but_newlines_allowed() {
        assert!(validate_message("bad\u{0}byte").is_err());
        assert!(validate_message("bell\u{7}").is_err());
        assert!(validate_message("line one\nline two\ttabbed").is_ok());
    }

    #[test]
    fn session_id_charset() {
        assert!(validate_session_id("user-42:web.main_1").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("slash/nope").is_err());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_CHARS + 1)).is_err());
    }
}
