use thiserror::Error;

/// Errors raised while composing cache keys.
///
/// Store operations are total and never fail; only key composition can reject
/// its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("invalid key context: `{field}` must not be empty")]
    InvalidKeyContext { field: &'static str },
}

impl CacheError {
    pub fn invalid_key_context(field: &'static str) -> Self {
        Self::InvalidKeyContext { field }
    }
}
