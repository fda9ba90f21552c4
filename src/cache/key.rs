//! Content-addressed cache keys.

use blake3::Hasher;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash of (operation, parameters, source). Parameters are order
    /// sensitive; line endings in the source are normalized so CRLF and LF
    /// snippets share entries.
    pub fn build(operation: &str, params: &[(&str, &str)], source: &str) -> Self {
        let mut hasher = Hasher::new();
        write_field(&mut hasher, operation.as_bytes());
        for (name, value) in params {
            write_field(&mut hasher, name.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }
        let normalized = normalize_source(source);
        write_field(&mut hasher, normalized.as_bytes());

        Self(format!("{}:{}", operation, hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn write_field(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn normalize_source(source: &str) -> std::borrow::Cow<'_, str> {
    if source.contains('\r') {
        std::borrow::Cow::Owned(source.replace("\r\n", "\n"))
    } else {
        std::borrow::Cow::Borrowed(source)
    }
}
