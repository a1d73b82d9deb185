use thiserror::Error;

pub const MAX_MESSAGE_LENGTH: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
    #[error("invalid format")]
    InvalidFormat,
}

/// Message text is measured in characters after trimming surrounding
/// whitespace.
pub fn validate_message_content(content: &str, max: usize) -> Result<(), ValidationError> {
    let trimmed = content.trim();
    let len = trimmed.chars().count();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > max {
        return Err(ValidationError::TooLong { max, got: len });
    }
    if trimmed.chars().any(|c| c == '\0') {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Key identifiers travel through config, the database and AEAD associated
/// data, so keep them to a small printable alphabet.
pub fn validate_key_id(key_id: &str) -> Result<(), ValidationError> {
    let len = key_id.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 64 {
        return Err(ValidationError::TooLong { max: 64, got: len });
    }
    if !key_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

pub fn validate_retention_days(days: i64) -> Result<(), ValidationError> {
    if days < 1 {
        return Err(ValidationError::TooShort { min: 1, got: 0 });
    }
    if days > 36_500 {
        return Err(ValidationError::TooLong {
            max: 36_500,
            got: days as usize,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_blank_messages_are_rejected() {
        assert!(matches!(
            validate_message_content("", MAX_MESSAGE_LENGTH),
            Err(ValidationError::TooShort { .. })
        ));
        assert!(validate_message_content("   \n", MAX_MESSAGE_LENGTH).is_err());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let text = "é".repeat(MAX_MESSAGE_LENGTH);
        assert!(validate_message_content(&text, MAX_MESSAGE_LENGTH).is_ok());
        let too_long = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert_eq!(
            validate_message_content(&too_long, MAX_MESSAGE_LENGTH),
            Err(ValidationError::TooLong {
                max: MAX_MESSAGE_LENGTH,
                got: MAX_MESSAGE_LENGTH + 1
            })
        );
    }

    #[test]
    fn key_ids_use_a_restricted_alphabet() {
        assert!(validate_key_id("t1-v2").is_ok());
        assert_eq!(
            validate_key_id("t1 v2"),
            Err(ValidationError::InvalidCharacters)
        );
        assert!(validate_key_id("").is_err());
    }

    #[test]
    fn retention_days_must_be_positive() {
        assert!(validate_retention_days(0).is_err());
        assert!(validate_retention_days(30).is_ok());
    }
}
