use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the three parts of a canonical key.
pub const KEY_SEPARATOR: char = ':';

/// Longest canonical key, in bytes, that every backend can store.
pub const MAX_KEY_LENGTH: usize = 512;

pub const NAMESPACE_HTTP: &str = "http";
pub const NAMESPACE_MQ: &str = "mq";
pub const NAMESPACE_JOB: &str = "job";

/// Identity of one protected operation instance.
///
/// The canonical form `namespace:scope:discriminator` is the only storage
/// identity; equality and hashing look at nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey {
    namespace: String,
    scope: String,
    discriminator: String,
    canonical: String,
}

impl IdempotencyKey {
    /// Builds a key from its three parts.
    ///
    /// `namespace` and `scope` must not contain the separator, otherwise the
    /// canonical form would not parse back to the same parts. The
    /// discriminator may contain it.
    pub fn new(
        namespace: impl Into<String>,
        scope: impl Into<String>,
        discriminator: impl Into<String>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let scope = scope.into();
        let discriminator = discriminator.into();

        for (name, part) in [("namespace", &namespace), ("scope", &scope)] {
            if part.is_empty() {
                return Err(AppError::InvalidKey(format!("{} must not be empty", name)));
            }
            if part.contains(KEY_SEPARATOR) {
                return Err(AppError::InvalidKey(format!(
                    "{} '{}' must not contain '{}'",
                    name, part, KEY_SEPARATOR
                )));
            }
        }
        if discriminator.is_empty() {
            return Err(AppError::InvalidKey(
                "discriminator must not be empty".to_string(),
            ));
        }

        let canonical = format!(
            "{}{sep}{}{sep}{}",
            namespace,
            scope,
            discriminator,
            sep = KEY_SEPARATOR
        );
        if canonical.len() > MAX_KEY_LENGTH {
            return Err(AppError::InvalidKey(format!(
                "canonical key is {} bytes, the limit is {}",
                canonical.len(),
                MAX_KEY_LENGTH
            )));
        }

        Ok(Self {
            namespace,
            scope,
            discriminator,
            canonical,
        })
    }

    /// Parses a canonical `namespace:scope:discriminator` string.
    pub fn parse(canonical: &str) -> Result<Self> {
        let mut parts = canonical.splitn(3, KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(scope), Some(discriminator)) => {
                Self::new(namespace, scope, discriminator)
            }
            _ => Err(AppError::InvalidKey(format!(
                "'{}' needs at least two '{}' separators",
                canonical, KEY_SEPARATOR
            ))),
        }
    }

    /// Derives the discriminator from a payload: hex SHA-256 of its JSON form.
    pub fn from_payload<T: Serialize>(
        namespace: impl Into<String>,
        scope: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        let json = serde_json::to_vec(payload).map_err(|e| {
            AppError::InvalidKey(format!("payload is not serializable: {}", e))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&json);
        Self::new(namespace, scope, hex::encode(hasher.finalize()))
    }

    /// Issues a fresh one-time token key, handed to a client before it submits.
    pub fn issue_token(namespace: impl Into<String>, scope: impl Into<String>) -> Result<Self> {
        Self::new(namespace, scope, Uuid::new_v4().simple().to_string())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Canonical form with the discriminator masked, for log fields.
    pub fn redacted(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.namespace,
            self.scope,
            crate::observability::mask_sensitive(&self.discriminator, 3),
            sep = KEY_SEPARATOR
        )
    }
}

impl PartialEq for IdempotencyKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for IdempotencyKey {}

impl Hash for IdempotencyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for IdempotencyKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.canonical
    }
}

/// Derives a key from whatever the caller is handling (a request, a message,
/// a job descriptor).
pub trait KeyResolver<I: ?Sized>: Send + Sync {
    fn resolve(&self, input: &I) -> Result<IdempotencyKey>;
}

impl<I: ?Sized, F> KeyResolver<I> for F
where
    F: Fn(&I) -> Result<IdempotencyKey> + Send + Sync,
{
    fn resolve(&self, input: &I) -> Result<IdempotencyKey> {
        self(input)
    }
}
