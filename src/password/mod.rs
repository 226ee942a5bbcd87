//! Password hashing, verification and policy checks.
//!
//! Hashes are SHA-512-crypt in shadow format (`$6$[rounds=N$]salt$hash`), so
//! the algorithm tag travels with the stored value.

mod dict;

pub use dict::WeakDictionary;

use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use sha_crypt::{sha512_check, sha512_simple, Sha512Params, ROUNDS_DEFAULT};
use tracing::error;

use crate::error::{Error, Result};

/// Minimum length accepted by [`crate::model::Principal::set_password`] regardless of policy.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Thresholds a new password must meet. A zero disables that check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rules {
    pub min_length: usize,
    pub max_length: usize,
    pub min_letters: usize,
    pub min_uppers: usize,
    pub min_lowers: usize,
    pub min_numbers: usize,
    pub min_specials: usize,
}

/// Hashes `password` with a fresh random salt.
///
/// # Errors
/// Returns `Internal` if the hasher rejects its parameters.
pub fn hash(password: &str) -> Result<String> {
    let params = Sha512Params::new(ROUNDS_DEFAULT)
        .map_err(|err| Error::internal(format!("invalid sha512-crypt parameters: {err:?}")))?;

    sha512_simple(password, &params).map_err(|err| {
        error!("Password hashing failed: {err:?}");
        Error::internal("password hashing failed")
    })
}

/// Checks `password` against a stored shadow-format hash.
///
/// # Errors
/// Every failure, malformed hashes included, is `PasswordMismatch`.
pub fn verify(password: &str, hashed: &str) -> Result<()> {
    if password.is_empty() || !hashed.starts_with("$6$") {
        return Err(Error::PasswordMismatch);
    }

    sha512_check(password, hashed).map_err(|_| Error::PasswordMismatch)
}

/// Lists every rule `password` violates, in a stable order.
#[must_use]
pub fn check_rules(password: &str, rules: &Rules, dict: &WeakDictionary) -> Vec<String> {
    let mut problems = Vec::new();
    let length = password.chars().count();

    if password.is_empty() {
        problems.push("No password was provided".to_string());
    } else if rules.min_length != 0 && length < rules.min_length {
        problems.push("Password is too short".to_string());
    } else if rules.max_length != 0 && length > rules.max_length {
        problems.push(format!("Password is too long: (>{})", rules.max_length));
        return problems;
    }

    if dict.is_weak(password) {
        problems.push("Password is a weak common password".to_string());
    }

    let (mut letters, mut uppers, mut lowers, mut numbers, mut specials) = (0, 0, 0, 0, 0);

    for (pos, c) in password.chars().enumerate() {
        if c.is_numeric() {
            numbers += 1;
        } else if c.is_uppercase() {
            uppers += 1;
            letters += 1;
        } else if c.is_lowercase() {
            lowers += 1;
            letters += 1;
        } else if c.is_alphabetic() {
            letters += 1;
        } else if c.is_whitespace() || c.is_control() {
            problems.push(format!("Invalid character encountered at position {}", pos + 1));
        } else {
            specials += 1;
        }
    }

    let minimums = [
        (rules.min_letters, letters, "letters"),
        (rules.min_uppers, uppers, "upper case letters"),
        (rules.min_lowers, lowers, "lower case letters"),
        (rules.min_specials, specials, "special characters"),
        (rules.min_numbers, numbers, "numbers"),
    ];

    for (min, got, what) in minimums {
        if min != 0 && got < min {
            problems.push(format!("Not enough {what} ({min}+)"));
        }
    }

    problems
}

/// Random alphanumeric string, used for recovery tokens and single-use codes.
#[must_use]
pub fn random_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Hex SHA-256, the stored form of single-use codes and recovery tokens.
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hashed = hash("correct horse battery staple").unwrap();
        assert!(hashed.starts_with("$6$"));
        assert!(verify("correct horse battery staple", &hashed).is_ok());
        assert!(matches!(
            verify("Correct horse battery staple", &hashed),
            Err(Error::PasswordMismatch)
        ));
    }

    #[test]
    fn salts_differ() {
        let a = hash("secret123").unwrap();
        let b = hash("secret123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_rejects_garbage_as_mismatch() {
        assert!(matches!(verify("x", ""), Err(Error::PasswordMismatch)));
        assert!(matches!(
            verify("x", "$1$abc$def"),
            Err(Error::PasswordMismatch)
        ));
        assert!(matches!(verify("", "$6$a$b"), Err(Error::PasswordMismatch)));
    }

    #[test]
    fn rules_report_in_order() {
        let rules = Rules {
            min_length: 12,
            min_uppers: 1,
            min_numbers: 2,
            ..Rules::default()
        };
        let dict = WeakDictionary::empty();
        let problems = check_rules("short", &rules, &dict);
        assert_eq!(
            problems,
            vec![
                "Password is too short".to_string(),
                "Not enough upper case letters (1+)".to_string(),
                "Not enough numbers (2+)".to_string(),
            ]
        );
    }

    #[test]
    fn too_long_stops_early() {
        let rules = Rules {
            max_length: 4,
            min_numbers: 3,
            ..Rules::default()
        };
        let problems = check_rules("abcdefgh", &rules, &WeakDictionary::empty());
        assert_eq!(problems, vec!["Password is too long: (>4)".to_string()]);
    }

    #[test]
    fn classes_are_counted() {
        let rules = Rules {
            min_letters: 3,
            min_uppers: 1,
            min_lowers: 2,
            min_numbers: 1,
            min_specials: 1,
            ..Rules::default()
        };
        assert!(check_rules("aB9!c", &rules, &WeakDictionary::empty()).is_empty());
    }

    #[test]
    fn whitespace_is_invalid() {
        let problems = check_rules("ab cd", &Rules::default(), &WeakDictionary::empty());
        assert_eq!(
            problems,
            vec!["Invalid character encountered at position 3".to_string()]
        );
    }

    #[test]
    fn weak_password_flagged() {
        let dict = WeakDictionary::from_words(["password"]);
        let problems = check_rules("PassWord", &Rules::default(), &dict);
        assert_eq!(problems, vec!["Password is a weak common password".to_string()]);
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn random_token_length() {
        let token = random_token(16);
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
