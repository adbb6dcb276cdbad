//! Identity key derivation.
//!
//! The key is the single basis for collision detection in the index
//! and the store, so the derivation must stay pure and deterministic.

use thiserror::Error;

const ID_PREFIX_LEN: usize = 6;
const NAME_PREFIX_LEN: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentError {
    #[error("invalid input: {field} must be at least {required} characters, got {actual}")]
    InvalidInput {
        field: &'static str,
        required: usize,
        actual: usize,
    },
}

/// Derive the identity key from the raw enrollment inputs: the first 6
/// characters of the external identifier followed by the first 3
/// characters of the display name, lowercased.
///
/// Identical inputs always yield an identical key.
pub fn derive_identity_key(external_id: &str, display_name: &str) -> Result<String, IdentError> {
    let id_part = lowercase_prefix(external_id, ID_PREFIX_LEN).ok_or(IdentError::InvalidInput {
        field: "external_id",
        required: ID_PREFIX_LEN,
        actual: external_id.chars().count(),
    })?;
    let name_part =
        lowercase_prefix(display_name, NAME_PREFIX_LEN).ok_or(IdentError::InvalidInput {
            field: "display_name",
            required: NAME_PREFIX_LEN,
            actual: display_name.chars().count(),
        })?;

    Ok(format!("{id_part}{name_part}"))
}

/// First `len` characters of `s`, lowercased. None if `s` is shorter.
fn lowercase_prefix(s: &str, len: usize) -> Option<String> {
    let mut out = String::with_capacity(len);
    let mut taken = 0;
    for c in s.chars() {
        if taken == len {
            break;
        }
        out.extend(c.to_lowercase());
        taken += 1;
    }
    if taken == len {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_fluffy() {
        let key = derive_identity_key("123456789", "Fluffy").unwrap();
        assert_eq!(key, "123456flu");
    }

    #[test]
    fn test_derive_rex() {
        let key = derive_identity_key("987654321", "Rex").unwrap();
        assert_eq!(key, "987654rex");
    }

    #[test]
    fn test_lowercases_both_parts() {
        let key = derive_identity_key("ABCDEF99", "LUNA").unwrap();
        assert_eq!(key, "abcdeflun");
    }

    #[test]
    fn test_short_id_rejected() {
        let err = derive_identity_key("12345", "Fluffy").unwrap_err();
        assert_eq!(
            err,
            IdentError::InvalidInput {
                field: "external_id",
                required: 6,
                actual: 5,
            }
        );
    }

    #[test]
    fn test_short_name_rejected() {
        let err = derive_identity_key("123456", "Bo").unwrap_err();
        assert_eq!(
            err,
            IdentError::InvalidInput {
                field: "display_name",
                required: 3,
                actual: 2,
            }
        );
    }

    #[test]
    fn test_deterministic() {
        let a = derive_identity_key("555666777", "Mimi").unwrap();
        let b = derive_identity_key("555666777", "Mimi").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_exact_minimum_lengths() {
        let key = derive_identity_key("123456", "Ana").unwrap();
        assert_eq!(key, "123456ana");
    }
}
