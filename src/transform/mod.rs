//! Value Transformers
//!
//! Transformers intercept individual values on their way out of the merged
//! view (reads) and on their way into a writable source (writes). The chain
//! is ordered by descending priority: reads run it front to back, writes run
//! it back to front, so the highest-priority transformer is the last to touch
//! a value before it is persisted and the first to see it after retrieval.

pub mod encryption;
pub mod mask;

pub use encryption::{EncryptionTransformer, ValueCipher, ENCRYPTED_MARKER};
pub use mask::Masker;

use crate::error::{ConfigError, Result};
use std::sync::Arc;

/// Read/write interceptor for configuration values.
///
/// Implementations must pass `None` through unchanged and must be idempotent
/// over their own output, typically by recognising a marker prefix.
pub trait ValueTransformer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Higher runs closer to the persisted medium
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this transformer applies to `key` with its current `value`
    fn should_transform(&self, key: &str, value: Option<&str>) -> bool;

    fn transform_on_read(&self, key: &str, value: Option<String>) -> anyhow::Result<Option<String>>;

    fn transform_on_write(&self, key: &str, value: Option<String>) -> anyhow::Result<Option<String>>;
}

/// Immutable, priority-ordered list of transformers
#[derive(Clone, Default)]
pub struct TransformerChain {
    transformers: Vec<Arc<dyn ValueTransformer>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain with `transformer` added; equal priorities keep insertion order
    pub fn with(&self, transformer: Arc<dyn ValueTransformer>) -> Self {
        let mut transformers = self.transformers.clone();
        transformers.push(transformer);
        transformers.sort_by_key(|t| std::cmp::Reverse(t.priority()));
        Self { transformers }
    }

    /// Chain without the transformers called `name`
    pub fn without(&self, name: &str) -> Self {
        Self {
            transformers: self
                .transformers
                .iter()
                .filter(|t| t.name() != name)
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Transformer names in read order
    pub fn names(&self) -> Vec<String> {
        self.transformers.iter().map(|t| t.name().to_string()).collect()
    }

    /// Apply the read path to a stored value
    pub fn apply_read(&self, key: &str, value: Option<String>) -> Result<Option<String>> {
        self.transformers.iter().try_fold(value, |value, transformer| {
            if !transformer.should_transform(key, value.as_deref()) {
                return Ok(value);
            }
            transformer
                .transform_on_read(key, value)
                .map_err(|error| transform_error(key, transformer.as_ref(), error))
        })
    }

    /// Apply the write path to a value about to be persisted
    pub fn apply_write(&self, key: &str, value: Option<String>) -> Result<Option<String>> {
        self.transformers.iter().rev().try_fold(value, |value, transformer| {
            if !transformer.should_transform(key, value.as_deref()) {
                return Ok(value);
            }
            transformer
                .transform_on_write(key, value)
                .map_err(|error| transform_error(key, transformer.as_ref(), error))
        })
    }
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn transform_error(key: &str, transformer: &dyn ValueTransformer, error: anyhow::Error) -> ConfigError {
    ConfigError::Transform {
        key: key.to_string(),
        transformer: transformer.name().to_string(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Wraps values in `name(...)` and records the order it ran in
    struct Wrap {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ValueTransformer for Wrap {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn should_transform(&self, key: &str, _value: Option<&str>) -> bool {
            key.starts_with("Secret")
        }

        fn transform_on_read(&self, _key: &str, value: Option<String>) -> anyhow::Result<Option<String>> {
            self.log.lock().push(format!("read:{}", self.name));
            Ok(value.map(|v| {
                v.strip_prefix(&format!("{}(", self.name))
                    .and_then(|v| v.strip_suffix(')'))
                    .map(str::to_string)
                    .unwrap_or(v)
            }))
        }

        fn transform_on_write(&self, _key: &str, value: Option<String>) -> anyhow::Result<Option<String>> {
            self.log.lock().push(format!("write:{}", self.name));
            Ok(value.map(|v| format!("{}({})", self.name, v)))
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>) -> TransformerChain {
        TransformerChain::new()
            .with(Arc::new(Wrap { name: "low", priority: 1, log: log.clone() }))
            .with(Arc::new(Wrap { name: "high", priority: 10, log: log.clone() }))
    }

    #[test]
    fn test_write_runs_highest_priority_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        let stored = chain.apply_write("Secret", Some("v".into())).unwrap();
        assert_eq!(stored.as_deref(), Some("high(low(v))"));
        assert_eq!(*log.lock(), vec!["write:low", "write:high"]);
    }

    #[test]
    fn test_read_mirrors_write_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        let stored = chain.apply_write("Secret", Some("v".into())).unwrap();
        log.lock().clear();
        let read = chain.apply_read("Secret", stored).unwrap();

        assert_eq!(read.as_deref(), Some("v"));
        assert_eq!(*log.lock(), vec!["read:high", "read:low"]);
    }

    #[test]
    fn test_non_matching_keys_untouched() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);

        assert_eq!(chain.apply_write("Plain", Some("v".into())).unwrap().as_deref(), Some("v"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_without_removes_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log).without("high");
        assert_eq!(chain.names(), vec!["low"]);
    }
}
