use std::sync::LazyLock;

use crate::common::error::Error;
use crate::common::password::complexity_violation;
use regex::Regex;
use validator::{Validate, ValidationError};

/// E.164-shaped mobile numbers: optional +, leading non-zero digit, 8-15
/// digits total.
static MOBILE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+?[1-9][0-9]{7,14}$").expect("static regex is valid")
});

/// Validates a request DTO using the validator crate
pub fn validate_request<T: Validate>(data: &T) -> Result<(), Error> {
    data.validate().map_err(|e| {
        let messages: Vec<String> = e
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                let field = field.to_string();
                errors.iter().map(move |err| {
                    format!(
                        "{}: {}",
                        field,
                        err.message
                            .as_ref()
                            .unwrap_or(&std::borrow::Cow::Borrowed("validation failed"))
                    )
                })
            })
            .collect();

        Error::BadRequest(messages.join(", "))
    })
}

/// Person-name fields: non-empty, bounded, no control characters.
pub fn validate_person_name(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("name_required").with_message("name cannot be empty".into()));
    }

    if value.chars().count() > 100 {
        return Err(ValidationError::new("name_too_long")
            .with_message("name exceeds maximum length of 100 characters".into()));
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(ValidationError::new("invalid_name_characters")
            .with_message("name contains control characters".into()));
    }

    Ok(())
}

/// Mobile numbers, E.164 shape. Spaces and dashes are stripped before the
/// check so common formatting survives.
pub fn validate_mobile_number(value: &str) -> Result<(), ValidationError> {
    let compact: String = value.chars().filter(|c| !matches!(c, ' ' | '-')).collect();

    if MOBILE_NUMBER.is_match(&compact) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_mobile_number")
            .with_message("must be an international number, e.g. +14155550123".into()))
    }
}

/// New-password fields: the structural complexity rules. The
/// compromised-password oracle runs later, inside the password service,
/// where a lookup dependency is available.
pub fn validate_new_password(value: &str) -> Result<(), ValidationError> {
    match complexity_violation(value) {
        None => Ok(()),
        Some(msg) => {
            // complexity_violation prefixes messages with "password: "
            let detail = msg.strip_prefix("password: ").unwrap_or(&msg).to_string();
            Err(ValidationError::new("weak_password").with_message(detail.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_name_rules() {
        assert!(validate_person_name("Ada").is_ok());
        assert!(validate_person_name("María-José O'Neil").is_ok());
        assert!(validate_person_name("").is_err());
        assert!(validate_person_name("   ").is_err());
        assert!(validate_person_name(&"x".repeat(101)).is_err());
        assert!(validate_person_name("bad\u{0007}name").is_err());
    }

    #[test]
    fn test_mobile_number_rules() {
        assert!(validate_mobile_number("+14155550123").is_ok());
        assert!(validate_mobile_number("+44 20 7946 0958").is_ok());
        assert!(validate_mobile_number("+1234567890123456").is_err()); // 16 digits
        assert!(validate_mobile_number("0123456789").is_err()); // leading zero
        assert!(validate_mobile_number("not a number").is_err());
        assert!(validate_mobile_number("12345").is_err());
    }

    #[test]
    fn test_new_password_rules() {
        assert!(validate_new_password("Str0ng!Passw0rd").is_ok());
        assert!(validate_new_password("weak").is_err());
        assert!(validate_new_password("nouppercase1!aa").is_err());
    }

    #[test]
    fn test_validate_request_formats_messages() {
        use validator::Validate;

        #[derive(Validate)]
        struct Dto {
            #[validate(email(message = "must be a valid email address"))]
            email: String,
        }

        let bad = Dto {
            email: "nope".to_string(),
        };
        let err = validate_request(&bad).unwrap_err();
        match err {
            Error::BadRequest(msg) => assert!(msg.contains("email")),
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }
}
