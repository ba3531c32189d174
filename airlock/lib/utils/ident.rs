use rand::RngCore;

use crate::{AirlockError, AirlockResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest identifier accepted from a caller. Matches the Kubernetes label value limit so
/// identifiers can be written to labels without truncation.
pub const MAX_IDENT_LENGTH: usize = 63;

/// Number of random bytes in a generated sandbox name suffix.
const NAME_SUFFIX_BYTES: usize = 4;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates a caller-supplied identifier before it is used in an object name, label, or
/// selector.
///
/// Tenant and thread identifiers end up in cluster metadata, so the accepted alphabet is
/// strict: lowercase alphanumerics and hyphens, no leading or trailing hyphen, at most
/// [`MAX_IDENT_LENGTH`] characters. Anything else is rejected with a
/// [`AirlockError::ValidationError`] naming the offending field.
pub fn validate_safe_ident(field: &str, value: &str) -> AirlockResult<()> {
    if value.is_empty() {
        return Err(AirlockError::ValidationError(format!(
            "{} must not be empty",
            field
        )));
    }

    if value.len() > MAX_IDENT_LENGTH {
        return Err(AirlockError::ValidationError(format!(
            "{} '{}' is longer than {} characters",
            field, value, MAX_IDENT_LENGTH
        )));
    }

    if value.starts_with('-') || value.ends_with('-') {
        return Err(AirlockError::ValidationError(format!(
            "{} '{}' must not start or end with a hyphen",
            field, value
        )));
    }

    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(AirlockError::ValidationError(format!(
            "{} '{}' contains forbidden character '{}': only lowercase alphanumerics and hyphens are allowed",
            field, value, bad
        )));
    }

    Ok(())
}

/// Generates a cluster-safe object name with a random hex suffix, e.g. `sbx-9f2c41aa`.
pub fn random_name(prefix: &str) -> String {
    let mut bytes = [0u8; NAME_SUFFIX_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}-{}", prefix, hex::encode(bytes))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_safe_ident_accepts_plain_identifiers() {
        assert!(validate_safe_ident("thread_id", "incident-42").is_ok());
        assert!(validate_safe_ident("thread_id", "a").is_ok());
        assert!(validate_safe_ident("tenant_id", "acme-prod-7").is_ok());
        assert!(validate_safe_ident("thread_id", &"x".repeat(MAX_IDENT_LENGTH)).is_ok());
    }

    #[test]
    fn test_validate_safe_ident_rejects_unsafe_identifiers() {
        let cases = [
            ("Incident/42", "forbidden character"),
            ("incident 42", "forbidden character"),
            ("INCIDENT-42", "forbidden character"),
            ("incident_42", "forbidden character"),
            ("-incident", "must not start or end"),
            ("incident-", "must not start or end"),
            ("", "must not be empty"),
        ];

        for (value, fragment) in cases {
            let err = validate_safe_ident("thread_id", value).unwrap_err();
            assert!(
                matches!(&err, AirlockError::ValidationError(msg) if msg.contains(fragment)),
                "identifier '{}' should be rejected with '{}', got: {}",
                value,
                fragment,
                err
            );
        }
    }

    #[test]
    fn test_validate_safe_ident_rejects_overlong_identifiers() {
        let overlong = "x".repeat(MAX_IDENT_LENGTH + 1);
        let err = validate_safe_ident("thread_id", &overlong).unwrap_err();
        assert!(matches!(&err, AirlockError::ValidationError(msg) if msg.contains("longer than")));
    }

    #[test]
    fn test_random_name_shape() {
        let name = random_name("sbx");
        assert!(name.starts_with("sbx-"));
        assert_eq!(name.len(), "sbx-".len() + NAME_SUFFIX_BYTES * 2);
        assert!(validate_safe_ident("name", &name).is_ok());

        // Suffixes should differ between calls.
        assert_ne!(random_name("sbx"), random_name("sbx"));
    }
}
