//! Shape validation for the emergency contact number.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Country calling codes accepted for the emergency contact.
pub const SUPPORTED_COUNTRY_CODES: &[&str] =
    &["593", "52", "54", "55", "56", "57", "58", "591", "595", "598"];

/// Minimum number of digits after the leading `+`.
pub const MIN_DIGITS: usize = 10;

static NON_DIALABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d+]").expect("valid regex"));
static GROUPING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\+\d{2,3})(\d{3})(\d{3})(\d{4})").expect("valid regex"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("number must start with the country code (e.g. +593)")]
    MissingCountryCode,

    #[error("number must have at least 10 digits after the country code prefix (got {0})")]
    TooShort(usize),

    #[error("country code of '{0}' is not supported")]
    UnsupportedCountryCode(String),
}

/// Strips everything except digits and `+`.
#[must_use]
pub fn normalize(phone: &str) -> String {
    NON_DIALABLE.replace_all(phone, "").into_owned()
}

/// Validates an international number and returns it grouped for display,
/// e.g. `+593 987 654 3210`.
///
/// # Errors
///
/// Returns a [`PhoneError`] describing the first rule the number breaks.
pub fn validate_phone(phone: &str) -> Result<String, PhoneError> {
    let cleaned = normalize(phone);

    let Some(rest) = cleaned.strip_prefix('+') else {
        return Err(PhoneError::MissingCountryCode);
    };

    let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_DIGITS {
        return Err(PhoneError::TooShort(digits.len()));
    }

    if !SUPPORTED_COUNTRY_CODES
        .iter()
        .any(|code| digits.starts_with(code))
    {
        return Err(PhoneError::UnsupportedCountryCode(cleaned));
    }

    Ok(GROUPING.replace(&cleaned, "$1 $2 $3 $4").into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_formatting() {
        assert_eq!(normalize("+593 (98) 765-4321"), "+593987654321");
        assert_eq!(normalize(" 12 ab 3"), "123");
    }

    #[test]
    fn test_requires_plus_prefix() {
        assert_eq!(
            validate_phone("593987654321"),
            Err(PhoneError::MissingCountryCode)
        );
    }

    #[test]
    fn test_requires_ten_digits() {
        assert_eq!(validate_phone("+593 98765"), Err(PhoneError::TooShort(8)));
    }

    #[test]
    fn test_rejects_unknown_country_code() {
        assert!(matches!(
            validate_phone("+1 555 123 4567"),
            Err(PhoneError::UnsupportedCountryCode(_))
        ));
    }

    #[test]
    fn test_accepts_two_digit_country_code() {
        assert!(validate_phone("+52 155 1234 5678").is_ok());
    }

    #[test]
    fn test_formats_grouped_number() {
        assert_eq!(
            validate_phone("+57 300 123 4567").as_deref(),
            Ok("+57 300 123 4567")
        );
        assert_eq!(
            validate_phone("+593-9876-54321").as_deref(),
            Ok("+59 398 765 4321")
        );
    }
}
