//! Authentication
//!
//! `AuthorizedKeys` parses OpenSSH authorized_keys files; `Authenticator`
//! turns the configured policy into one immutable `AuthDecision` per
//! credential attempt.

use crate::config::Config;
use crate::{Error, Result};
use russh::keys::ssh_key::PublicKey;
use russh::keys::HashAlg;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Key type prefixes that can start the key part of an authorized_keys line
const KEY_TYPE_PREFIXES: [&str; 4] = ["ssh-", "ecdsa-sha2-", "sk-", "rsa-sha2-"];

/// Authorized keys manager
///
/// Keys are compared by SHA-256 fingerprint.
pub struct AuthorizedKeys {
    /// Path to authorized_keys file
    keys_file: PathBuf,
    /// Fingerprints of the loaded keys
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    pub fn new(keys_file: impl Into<PathBuf>) -> Self {
        Self {
            keys_file: keys_file.into(),
            fingerprints: HashSet::new(),
        }
    }

    /// Load authorized keys from file
    ///
    /// Lines that fail to parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the file cannot be read.
    pub fn load(&mut self) -> Result<()> {
        let contents = fs::read_to_string(&self.keys_file).map_err(|e| {
            Error::Config(format!(
                "Failed to read authorized keys {}: {}",
                self.keys_file.display(),
                e
            ))
        })?;

        self.fingerprints.clear();
        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match parse_key_line(trimmed) {
                Ok(key) => {
                    debug!("Loaded public key from line {}", index + 1);
                    self.fingerprints
                        .insert(key.fingerprint(HashAlg::Sha256).to_string());
                }
                Err(e) => {
                    warn!(
                        path = %self.keys_file.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping unparseable authorized key"
                    );
                }
            }
        }

        info!(
            "Loaded {} authorized keys from {}",
            self.fingerprints.len(),
            self.keys_file.display()
        );

        Ok(())
    }

    /// Verify if a public key is authorized
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.fingerprints
            .contains(&key.fingerprint(HashAlg::Sha256).to_string())
    }

    /// Get the number of loaded keys
    pub fn count(&self) -> usize {
        self.fingerprints.len()
    }
}

/// Parse one authorized_keys line: `[options] <type> <base64> [comment]`
fn parse_key_line(line: &str) -> Result<PublicKey> {
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Ok(key);
    }

    // Leading options; the key starts at the first token naming a key type
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let start = tokens
        .iter()
        .skip(1)
        .position(|token| KEY_TYPE_PREFIXES.iter().any(|prefix| token.starts_with(prefix)))
        .map(|pos| pos + 1)
        .ok_or_else(|| Error::Config("Invalid key format: no key type found".into()))?;

    PublicKey::from_openssh(&tokens[start..].join(" "))
        .map_err(|e| Error::Config(format!("Failed to parse public key: {}", e)))
}

/// How a client tried to authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
    PublicKey,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
        })
    }
}

/// One credential attempt as offered during the SSH handshake
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    None { user: &'a str },
    Password { user: &'a str, password: &'a str },
    PublicKey { user: &'a str, key: &'a PublicKey },
}

impl Credential<'_> {
    pub fn user(&self) -> &str {
        match self {
            Credential::None { user }
            | Credential::Password { user, .. }
            | Credential::PublicKey { user, .. } => user,
        }
    }

    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::None { .. } => AuthMethod::None,
            Credential::Password { .. } => AuthMethod::Password,
            Credential::PublicKey { .. } => AuthMethod::PublicKey,
        }
    }
}

/// Immutable result of evaluating one credential attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthDecision {
    accepted: bool,
    principal: Option<String>,
    method: AuthMethod,
    reason: Option<&'static str>,
}

impl AuthDecision {
    fn accept(method: AuthMethod, principal: &str) -> Self {
        Self {
            accepted: true,
            principal: Some(principal.to_string()),
            method,
            reason: None,
        }
    }

    fn reject(method: AuthMethod, reason: &'static str) -> Self {
        Self {
            accepted: false,
            principal: None,
            method,
            reason: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Authenticated user name, set only on acceptance
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }
}

/// Evaluates credential attempts against the configured policy
///
/// Precedence: no-auth accepts everything; otherwise passwords are checked
/// against the single user/password pair and public keys against the
/// authorized keys list. Read-only after construction.
pub struct Authenticator {
    no_auth: bool,
    password: Option<(String, String)>,
    authorized_keys: Option<AuthorizedKeys>,
}

impl Authenticator {
    /// Open access, every attempt accepted
    pub fn no_auth() -> Self {
        Self {
            no_auth: true,
            password: None,
            authorized_keys: None,
        }
    }

    /// Build the policy from configuration
    ///
    /// A missing authorized keys file at the default location simply leaves
    /// public-key authentication off; an explicitly configured one must load.
    ///
    /// # Errors
    ///
    /// `NoAuthPolicy` when no policy results, `Config` when an explicitly
    /// configured authorized keys file cannot be read.
    pub fn from_config(config: &Config) -> Result<Self> {
        let password = match (&config.user, &config.pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        let authorized_keys = match config.authorized_keys_path() {
            Some(path) if !path.exists() && config.authorized_keys_is_default() => {
                debug!(path = %path.display(), "No authorized keys file at default location");
                None
            }
            Some(path) => {
                let mut keys = AuthorizedKeys::new(path);
                keys.load()?;
                Some(keys)
            }
            None => None,
        };

        let authenticator = Self {
            no_auth: config.no_auth,
            password,
            authorized_keys,
        };
        if !authenticator.has_policy() {
            return Err(Error::NoAuthPolicy);
        }

        if authenticator.no_auth {
            warn!(event = "auth_disabled", "Authentication is disabled, accepting every client");
        }
        Ok(authenticator)
    }

    /// Password policy only
    pub fn with_password(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            no_auth: false,
            password: Some((user.into(), pass.into())),
            authorized_keys: None,
        }
    }

    /// Public key policy only
    pub fn with_authorized_keys(keys: AuthorizedKeys) -> Self {
        Self {
            no_auth: false,
            password: None,
            authorized_keys: Some(keys),
        }
    }

    fn has_policy(&self) -> bool {
        self.no_auth || self.password.is_some() || self.authorized_keys.is_some()
    }

    /// Evaluate one attempt; pure, logging is left to the caller
    pub fn authenticate(&self, credential: &Credential<'_>) -> AuthDecision {
        let method = credential.method();
        if self.no_auth {
            return AuthDecision::accept(method, credential.user());
        }

        match credential {
            Credential::None { .. } => AuthDecision::reject(method, "authentication required"),
            Credential::Password { user, password } => match &self.password {
                Some((expected_user, expected_pass))
                    if user == expected_user && password == expected_pass =>
                {
                    AuthDecision::accept(method, user)
                }
                Some(_) => AuthDecision::reject(method, "wrong user or password"),
                None => AuthDecision::reject(method, "password authentication not enabled"),
            },
            Credential::PublicKey { user, key } => match &self.authorized_keys {
                Some(keys) if keys.is_authorized(key) => AuthDecision::accept(method, user),
                Some(_) => AuthDecision::reject(method, "key not authorized"),
                None => AuthDecision::reject(method, "public key authentication not enabled"),
            },
        }
    }
}
