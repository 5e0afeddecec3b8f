use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Request header carrying a client-chosen idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Upper bound applied by [`KeyDeriver::derive_checked`] to client-supplied keys.
pub const MAX_CLIENT_KEY_BYTES: usize = 255;

/// Read-only access to request headers. Lookups are case-insensitive.
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

impl<S: BuildHasher> HeaderLookup for HashMap<String, String, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl HeaderLookup for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl HeaderLookup for [(&str, &str)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }
}

impl<const N: usize> HeaderLookup for [(&str, &str); N] {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}

impl<T: HeaderLookup + ?Sized> HeaderLookup for &T {
    fn header(&self, name: &str) -> Option<&str> {
        (**self).header(name)
    }
}

/// Cache key of the form `<operation-prefix>:<client-key-or-uuid>`.
///
/// Equality and hashing consider only the full string.
#[derive(Clone, Debug)]
pub struct IdempotencyKey {
    value: String,
    prefix_len: usize,
}

impl IdempotencyKey {
    /// Joins `prefix` and `suffix` with `:`.
    ///
    /// The prefix ends at the first separator, so any `:` inside `prefix`
    /// is replaced with `.` (see [`operation_prefix`]). The suffix is kept
    /// verbatim.
    pub fn new(prefix: &str, suffix: &str) -> Self {
        let prefix = operation_prefix(prefix);
        Self {
            value: format!("{prefix}:{suffix}"),
            prefix_len: prefix.len(),
        }
    }

    /// Parses a stored key, splitting the prefix at the first `:`.
    /// A key without a separator has an empty prefix.
    pub fn parse(raw: impl Into<String>) -> Self {
        let value = raw.into();
        let prefix_len = value.find(':').unwrap_or(0);
        Self { value, prefix_len }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn prefix(&self) -> &str {
        &self.value[..self.prefix_len]
    }

    /// The client-facing part of the key, echoed back in response headers.
    pub fn suffix(&self) -> &str {
        if self.prefix_len == 0 && !self.value.starts_with(':') {
            &self.value
        } else {
            &self.value[self.prefix_len + 1..]
        }
    }
}

impl PartialEq for IdempotencyKey {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for IdempotencyKey {}

impl Hash for IdempotencyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl From<&str> for IdempotencyKey {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for IdempotencyKey {
    fn from(raw: String) -> Self {
        Self::parse(raw)
    }
}

impl Serialize for IdempotencyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de> Deserialize<'de> for IdempotencyKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::parse)
    }
}

/// Normalizes an operation name for use as a key prefix: `:` becomes `.`.
pub fn operation_prefix(name: &str) -> Cow<'_, str> {
    if name.contains(':') {
        Cow::Owned(name.replace(':', "."))
    } else {
        Cow::Borrowed(name)
    }
}

/// Aggregated problems found in a client-supplied key.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub messages: Vec<String>,
}

impl ValidationIssue {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.messages.is_empty() {
            write!(f, "no validation issues")
        } else {
            write!(f, "{}", self.messages.join("; "))
        }
    }
}

impl std::error::Error for ValidationIssue {}

/// Builds cache keys from an operation prefix and request headers.
#[derive(Clone, Debug)]
pub struct KeyDeriver {
    header_name: String,
    max_client_key_bytes: usize,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            max_client_key_bytes: MAX_CLIENT_KEY_BYTES,
        }
    }
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn with_max_client_key_bytes(mut self, max: usize) -> Self {
        self.max_client_key_bytes = max;
        self
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Derives a key without inspecting the client value.
    ///
    /// An empty header counts as absent. Without a header the fallback is
    /// used, and without a fallback a random v4 UUID.
    pub fn derive<H: HeaderLookup + ?Sized>(
        &self,
        prefix: &str,
        headers: &H,
        fallback: Option<&str>,
    ) -> IdempotencyKey {
        match headers
            .header(&self.header_name)
            .filter(|value| !value.is_empty())
        {
            Some(client_key) => IdempotencyKey::new(prefix, client_key),
            None => match fallback {
                Some(id) => IdempotencyKey::new(prefix, id),
                None => IdempotencyKey::new(prefix, &Uuid::new_v4().to_string()),
            },
        }
    }

    /// Like [`KeyDeriver::derive`], but rejects malformed client keys.
    pub fn derive_checked<H: HeaderLookup + ?Sized>(
        &self,
        prefix: &str,
        headers: &H,
        fallback: Option<&str>,
    ) -> Result<IdempotencyKey, ValidationIssue> {
        if let Some(client_key) = headers.header(&self.header_name)
            && !client_key.is_empty()
        {
            self.validate_client_key(client_key)?;
        }
        Ok(self.derive(prefix, headers, fallback))
    }

    pub fn validate_client_key(&self, value: &str) -> Result<(), ValidationIssue> {
        let mut errors = Vec::new();

        if value.trim().is_empty() {
            errors.push(format!("{} must not be empty", self.header_name));
        }
        if value.len() > self.max_client_key_bytes {
            errors.push(format!(
                "{} must be at most {} bytes, got {}",
                self.header_name,
                self.max_client_key_bytes,
                value.len()
            ));
        }
        if value.chars().any(char::is_control) {
            errors.push(format!(
                "{} must not contain control characters",
                self.header_name
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationIssue::new(errors))
        }
    }
}

/// Derives `"{prefix}:{key}"` using the conventional `Idempotency-Key` header.
pub fn derive_key<H: HeaderLookup + ?Sized>(
    prefix: &str,
    headers: &H,
    fallback: Option<&str>,
) -> IdempotencyKey {
    KeyDeriver::default().derive(prefix, headers, fallback)
}
