/// Maps a requested username to its canonical, uniqueness-bearing form.
/// Syntactic validation happens upstream; this only normalizes.
pub trait UsernameValidator: Send + Sync {
    fn canonical(&self, requested: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultUsernameValidator;

impl UsernameValidator for DefaultUsernameValidator {
    fn canonical(&self, requested: &str) -> String {
        requested.trim().to_lowercase()
    }
}

/// Best-effort country code of an E.164 number, used only to tag the
/// deletion metric. Zones 1 and 7 are one digit, zone 2 is three digits
/// outside Egypt and South Africa, everything else is treated as two.
pub fn country_code(e164: &str) -> &str {
    let digits = e164.strip_prefix('+').unwrap_or(e164);
    let len = match digits.as_bytes().first() {
        Some(b'1') | Some(b'7') => 1,
        Some(b'2') if !digits.starts_with("20") && !digits.starts_with("27") => 3,
        Some(_) => 2,
        None => 0,
    };
    &digits[..len.min(digits.len())]
}

#[cfg(test)]
mod validators_tests {
    use super::*;

    #[test]
    fn test_canonical_username() {
        let validator = DefaultUsernameValidator;
        assert_eq!(validator.canonical("  Ada.Lovelace "), "ada.lovelace");
        assert_eq!(validator.canonical("plain"), "plain");
    }

    #[test]
    fn test_country_code() {
        assert_eq!(country_code("+15550100"), "1");
        assert_eq!(country_code("+79160000000"), "7");
        assert_eq!(country_code("+4915112345678"), "49");
        assert_eq!(country_code("+27831234567"), "27");
        assert_eq!(country_code("+2348012345678"), "234");
        assert_eq!(country_code(""), "");
    }
}
