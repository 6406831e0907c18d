use std::sync::LazyLock;

use argon2::{
    Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::error::{Error, Result};

/// argon2id parameters for newly stored passwords.
const ARGON2_MEMORY_KIB: u32 = 65536;
const ARGON2_ITERATIONS: u32 = 10;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

pub const PASSWORD_MIN_LEN: usize = 12;
pub const PASSWORD_MAX_LEN: usize = 128;
const MAX_CONSECUTIVE_REPEATS: usize = 3;

/// Pre-computed argon2id hash used to burn CPU on login attempts for
/// non-existent accounts so the response time is indistinguishable from a
/// real password check.
static DUMMY_PASSWORD_HASH: LazyLock<String> = LazyLock::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    hasher()
        .hash_password(b"dummy-password-for-timing-equalization", &salt)
        .expect("Failed to generate dummy password hash")
        .to_string()
});

/// Hash families accepted at verification time. Only argon2id is written;
/// the others exist so accounts imported from older deployments keep
/// working until their next successful login rehashes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFamily {
    Argon2id,
    Bcrypt,
    Pbkdf2Sha256,
}

impl HashFamily {
    pub fn detect(hash: &str) -> Option<Self> {
        if hash.starts_with("$argon2id$") {
            Some(Self::Argon2id)
        } else if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
            Some(Self::Bcrypt)
        } else if hash.starts_with("$pbkdf2-sha256$") {
            Some(Self::Pbkdf2Sha256)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub matches: bool,
    /// Stored hash is not argon2id; rehash after a successful login.
    pub needs_rehash: bool,
}

fn hasher() -> Argon2<'static> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LEN),
    )
    .expect("argon2 parameters are statically valid");
    Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params)
}

/// Oracle over known-compromised passwords. The production binding is a
/// haveibeenpwned-style range query; the default is a static deny list of
/// the worst offenders.
pub trait CompromisedPasswordOracle: Send + Sync {
    fn is_compromised(&self, password: &str) -> bool;
}

pub struct StaticDenyList;

const DENY_LIST: &[&str] = &[
    "password1234",
    "correcthorsebatterystaple",
    "qwerty123456",
    "letmein12345",
    "administrator1",
];

impl CompromisedPasswordOracle for StaticDenyList {
    fn is_compromised(&self, password: &str) -> bool {
        let lowered = password.to_lowercase();
        DENY_LIST.iter().any(|known| *known == lowered)
    }
}

#[derive(Clone)]
pub struct PasswordService {
    oracle: std::sync::Arc<dyn CompromisedPasswordOracle>,
}

impl PasswordService {
    pub fn new(oracle: std::sync::Arc<dyn CompromisedPasswordOracle>) -> Self {
        Self { oracle }
    }

    /// Hash a new password with the current argon2id parameters.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(hasher().hash_password(password.as_bytes(), &salt)?.to_string())
    }

    /// Verify a candidate against a stored hash of any accepted family.
    pub fn verify(&self, password: &str, stored: &str) -> Result<VerifyOutcome> {
        let family = HashFamily::detect(stored).ok_or_else(|| {
            Error::Internal("Unrecognized password hash family in storage".to_string())
        })?;

        let matches = match family {
            HashFamily::Argon2id => {
                let parsed = PasswordHash::new(stored)
                    .map_err(|e| Error::Internal(format!("Corrupt argon2 hash: {}", e)))?;
                hasher().verify_password(password.as_bytes(), &parsed).is_ok()
            }
            HashFamily::Bcrypt => bcrypt::verify(password, stored)
                .map_err(|e| Error::Internal(format!("Corrupt bcrypt hash: {}", e)))?,
            HashFamily::Pbkdf2Sha256 => {
                let parsed = PasswordHash::new(stored)
                    .map_err(|e| Error::Internal(format!("Corrupt pbkdf2 hash: {}", e)))?;
                pbkdf2::Pbkdf2
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            }
        };

        Ok(VerifyOutcome {
            matches,
            needs_rehash: matches && family != HashFamily::Argon2id,
        })
    }

    /// Run a full verification against a fixed hash. Called when the account
    /// does not exist so the caller's response time matches the real path.
    pub fn dummy_verify(&self, password: &str) {
        if let Ok(parsed) = PasswordHash::new(&DUMMY_PASSWORD_HASH) {
            let _ = hasher().verify_password(password.as_bytes(), &parsed);
        }
    }

    /// Enforce write-time complexity rules.
    pub fn check_complexity(&self, password: &str) -> Result<()> {
        if let Some(msg) = complexity_violation(password) {
            return Err(Error::BadRequest(msg));
        }

        if self.oracle.is_compromised(password) {
            return Err(Error::BadRequest(
                "password: appears in a known data breach".to_string(),
            ));
        }

        Ok(())
    }
}

/// Structural complexity rules, separated from the oracle so the validator
/// layer can reuse them without a service handle.
pub fn complexity_violation(password: &str) -> Option<String> {
    let len = password.chars().count();
    if len < PASSWORD_MIN_LEN || len > PASSWORD_MAX_LEN {
        return Some(format!(
            "password: length must be between {} and {} characters",
            PASSWORD_MIN_LEN, PASSWORD_MAX_LEN
        ));
    }

    if !password.chars().any(|c| c.is_uppercase()) {
        return Some("password: must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Some("password: must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("password: must contain a digit".to_string());
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return Some("password: must contain a special character".to_string());
    }

    let mut run_char = '\0';
    let mut run_len = 0usize;
    for c in password.chars() {
        if c == run_char {
            run_len += 1;
            if run_len > MAX_CONSECUTIVE_REPEATS {
                return Some(format!(
                    "password: no more than {} consecutive repeats of one character",
                    MAX_CONSECUTIVE_REPEATS
                ));
            }
        } else {
            run_char = c;
            run_len = 1;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn service() -> PasswordService {
        PasswordService::new(Arc::new(StaticDenyList))
    }

    #[test]
    fn test_hash_and_verify_roundtrip() {
        let svc = service();
        let hash = svc.hash("Str0ng!Passw0rd").unwrap();

        assert!(hash.starts_with("$argon2id$"));

        let ok = svc.verify("Str0ng!Passw0rd", &hash).unwrap();
        assert!(ok.matches);
        assert!(!ok.needs_rehash);

        let bad = svc.verify("Wrong!Passw0rd1", &hash).unwrap();
        assert!(!bad.matches);
    }

    #[test]
    fn test_hash_params_encoded() {
        let svc = service();
        let hash = svc.hash("Str0ng!Passw0rd").unwrap();
        assert!(hash.contains("m=65536"));
        assert!(hash.contains("t=10"));
        assert!(hash.contains("p=1"));
    }

    #[test]
    fn test_bcrypt_family_verifies_and_flags_rehash() {
        let svc = service();
        let stored = bcrypt::hash("LegacyPass!234", 4).unwrap();

        let outcome = svc.verify("LegacyPass!234", &stored).unwrap();
        assert!(outcome.matches);
        assert!(outcome.needs_rehash);

        let wrong = svc.verify("OtherPass!5678", &stored).unwrap();
        assert!(!wrong.matches);
        assert!(!wrong.needs_rehash);
    }

    #[test]
    fn test_unknown_family_is_an_error() {
        let svc = service();
        assert!(svc.verify("anything", "$md5$deadbeef").is_err());
        assert!(svc.verify("anything", "plaintext").is_err());
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(
            HashFamily::detect("$argon2id$v=19$m=65536,t=10,p=1$c2FsdA$aGFzaA"),
            Some(HashFamily::Argon2id)
        );
        assert_eq!(HashFamily::detect("$2b$12$abcdefghijk"), Some(HashFamily::Bcrypt));
        assert_eq!(
            HashFamily::detect("$pbkdf2-sha256$i=600000$c2FsdA$aGFzaA"),
            Some(HashFamily::Pbkdf2Sha256)
        );
        assert_eq!(HashFamily::detect("$argon2i$v=19$..."), None);
    }

    #[test]
    fn test_complexity_rules() {
        // Too short
        assert!(complexity_violation("Sh0rt!").is_some());
        // Missing digit
        assert!(complexity_violation("NoDigitsHere!!").is_some());
        // Missing upper
        assert!(complexity_violation("nouppercase1!aa").is_some());
        // Missing special
        assert!(complexity_violation("NoSpecials1234a").is_some());
        // Three consecutive repeats allowed, four are not
        assert!(complexity_violation("Goood!Pass111a").is_none());
        assert!(complexity_violation("Gooood!Pass11a").is_some());
        // Valid
        assert!(complexity_violation("Str0ng!Passw0rd").is_none());
    }

    #[test]
    fn test_deny_list() {
        let svc = service();
        assert!(svc.check_complexity("Password1234!a").is_ok());
        // Deny list match is case-insensitive
        assert!(StaticDenyList.is_compromised("QWERTY123456"));
    }

    #[test]
    fn test_dummy_verify_does_not_panic() {
        service().dummy_verify("whatever input arrives");
    }
}
