//! Image filter boundary.
//!
//! Workers run a chain of named filters over each input image. A filter takes
//! the current image bytes plus its JSON parameters and returns the new bytes
//! with a metadata object describing what it did. The output of one filter is
//! the input of the next.
//!
//! Pixel-level filters live outside this crate and are plugged in through
//! [`FilterRegistry::register`]. The built-in [`InspectFilter`] passes bytes
//! through unchanged and reports their size and SHA-256 digest, which makes a
//! worker runnable end to end without an imaging stack.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::registry::ALL_CAPABILITIES;

/// Errors raised while running filters.
#[derive(Debug, Error)]
pub enum FilterError {
    /// No implementation is registered under this name.
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// The input could not be read.
    #[error("Cannot read {path}: {reason}")]
    UnreadableInput {
        /// Input reference.
        path: String,
        /// Underlying error.
        reason: String,
    },

    /// The parameters do not fit the filter.
    #[error("Invalid parameters for {filter}: {reason}")]
    InvalidParams {
        /// Filter name.
        filter: String,
        /// What was wrong.
        reason: String,
    },

    /// The filter ran and failed.
    #[error("Filter {filter} failed: {reason}")]
    Failed {
        /// Filter name.
        filter: String,
        /// What went wrong.
        reason: String,
    },
}

/// Result of one filter application.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// Image bytes after the filter.
    pub bytes: Vec<u8>,
    /// What the filter did, reported back in the task result.
    pub metadata: serde_json::Value,
}

/// A named image transformation.
///
/// Filters are CPU-bound and synchronous; workers call them from a blocking
/// thread.
pub trait ImageFilter: Send + Sync {
    /// Name used in task payloads.
    fn name(&self) -> &str;

    /// Applies the filter to `image`.
    fn apply(&self, image: Vec<u8>, params: &serde_json::Value)
        -> Result<FilterOutput, FilterError>;
}

/// Pass-through filter reporting size and SHA-256 digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectFilter;

impl ImageFilter for InspectFilter {
    fn name(&self) -> &str {
        "inspect"
    }

    fn apply(
        &self,
        image: Vec<u8>,
        params: &serde_json::Value,
    ) -> Result<FilterOutput, FilterError> {
        let digest = hex::encode(Sha256::digest(&image));

        // Optional integrity check.
        if let Some(expected) = params.get("sha256") {
            let expected = expected.as_str().ok_or_else(|| FilterError::InvalidParams {
                filter: self.name().to_string(),
                reason: "sha256 must be a string".to_string(),
            })?;
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(FilterError::Failed {
                    filter: self.name().to_string(),
                    reason: format!("digest mismatch: expected {}, got {}", expected, digest),
                });
            }
        }

        let metadata = serde_json::json!({
            "filter": self.name(),
            "bytes": image.len(),
            "sha256": digest,
        });

        Ok(FilterOutput {
            bytes: image,
            metadata,
        })
    }
}

/// Named filters available to a worker.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn ImageFilter>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in filters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InspectFilter));
        registry
    }

    /// Adds (or replaces) a filter under its own name.
    pub fn register(&mut self, filter: Arc<dyn ImageFilter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    /// Looks up a filter.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageFilter>> {
        self.filters.get(name).cloned()
    }

    /// Registered filter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves a chain of filter names.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::UnknownFilter` for the first name without an
    /// implementation.
    pub fn chain(&self, names: &[String]) -> Result<FilterChain, FilterError> {
        let steps = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| FilterError::UnknownFilter(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterChain { steps })
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

/// An ordered, resolved list of filters.
#[derive(Clone)]
pub struct FilterChain {
    steps: Vec<Arc<dyn ImageFilter>>,
}

impl FilterChain {
    /// Runs every filter in order, feeding each one the previous output.
    ///
    /// # Arguments
    ///
    /// * `image` - Input bytes
    /// * `params` - Per-filter parameters keyed by filter name
    ///
    /// # Returns
    ///
    /// The final bytes and the metadata of each step.
    pub fn run(
        &self,
        image: Vec<u8>,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(Vec<u8>, Vec<serde_json::Value>), FilterError> {
        let mut bytes = image;
        let mut metadata = Vec::with_capacity(self.steps.len());

        for filter in &self.steps {
            let filter_params = params
                .get(filter.name())
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let output = filter.apply(bytes, &filter_params)?;
            bytes = output.bytes;
            metadata.push(output.metadata);
        }

        Ok((bytes, metadata))
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Parses a capability list such as `"resize, blur"` or `"all"`.
///
/// Blank entries are dropped; an empty list means `all`.
pub fn parse_capabilities(raw: &str) -> Vec<String> {
    let caps: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if caps.is_empty() || caps.iter().any(|c| c == ALL_CAPABILITIES) {
        vec![ALL_CAPABILITIES.to_string()]
    } else {
        caps
    }
}

/// Expands the wildcard into the filters the worker actually has.
///
/// `all` stands for exactly the `registered` names; explicit capabilities
/// are returned as given.
pub fn expand_capabilities(capabilities: &[String], registered: &[String]) -> Vec<String> {
    if capabilities.iter().any(|c| c == ALL_CAPABILITIES) {
        registered.to_vec()
    } else {
        capabilities.to_vec()
    }
}

/// Filters from `requested` that a worker cannot run: either outside its
/// `capabilities` or without a `registered` implementation.
///
/// Checked before a task's images are touched, so an unrunnable chain fails
/// the task once instead of failing every image.
pub fn unsupported_filters(
    requested: &[String],
    capabilities: &[String],
    registered: &[String],
) -> Vec<String> {
    let wildcard = capabilities.iter().any(|c| c == ALL_CAPABILITIES);
    requested
        .iter()
        .filter(|f| !(wildcard || capabilities.contains(f)) || !registered.contains(f))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl ImageFilter for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn apply(
            &self,
            image: Vec<u8>,
            _params: &serde_json::Value,
        ) -> Result<FilterOutput, FilterError> {
            Ok(FilterOutput {
                bytes: image.to_ascii_uppercase(),
                metadata: serde_json::json!({"filter": "upper"}),
            })
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_inspect_reports_digest() {
        let output = InspectFilter
            .apply(b"abc".to_vec(), &serde_json::Value::Null)
            .expect("inspect");
        assert_eq!(output.bytes, b"abc");
        assert_eq!(output.metadata["bytes"], 3);
        assert_eq!(
            output.metadata["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_inspect_digest_check() {
        let params = serde_json::json!({"sha256": "00"});
        let err = InspectFilter
            .apply(b"abc".to_vec(), &params)
            .expect_err("mismatch");
        assert!(matches!(err, FilterError::Failed { .. }));

        let params = serde_json::json!({"sha256": 7});
        let err = InspectFilter
            .apply(b"abc".to_vec(), &params)
            .expect_err("bad param");
        assert!(matches!(err, FilterError::InvalidParams { .. }));
    }

    #[test]
    fn test_chain_feeds_output_forward() {
        let mut registry = FilterRegistry::with_builtin();
        registry.register(Arc::new(Upper));

        let chain = registry.chain(&names(&["upper", "inspect"])).expect("chain");
        assert_eq!(chain.len(), 2);

        let (bytes, metadata) = chain.run(b"abc".to_vec(), &serde_json::Map::new()).expect("run");
        assert_eq!(bytes, b"ABC");
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[1]["bytes"], 3);
    }

    #[test]
    fn test_unknown_filter_in_chain() {
        let registry = FilterRegistry::with_builtin();
        let err = registry
            .chain(&names(&["inspect", "sepia"]))
            .err()
            .expect("unknown");
        assert!(matches!(err, FilterError::UnknownFilter(name) if name == "sepia"));
    }

    #[test]
    fn test_parse_capabilities() {
        assert_eq!(parse_capabilities("resize, blur ,"), names(&["resize", "blur"]));
        assert_eq!(parse_capabilities("all"), names(&["all"]));
        assert_eq!(parse_capabilities("resize,all"), names(&["all"]));
        assert_eq!(parse_capabilities("  "), names(&["all"]));
    }

    #[test]
    fn test_wildcard_expands_to_registered_filters() {
        let registry = FilterRegistry::with_builtin();
        assert_eq!(
            expand_capabilities(&names(&["all"]), &registry.names()),
            names(&["inspect"])
        );
        assert_eq!(
            expand_capabilities(&names(&["blur"]), &registry.names()),
            names(&["blur"])
        );
    }

    #[test]
    fn test_unsupported_filters() {
        let registered = names(&["edges", "inspect", "resize"]);

        assert!(unsupported_filters(&names(&["edges"]), &names(&["all"]), &registered).is_empty());
        assert_eq!(
            unsupported_filters(&names(&["resize", "edges"]), &names(&["resize"]), &registered),
            names(&["edges"])
        );

        // The wildcard does not cover filters without an implementation.
        assert_eq!(
            unsupported_filters(&names(&["inspect", "sepia"]), &names(&["all"]), &registered),
            names(&["sepia"])
        );
        assert_eq!(
            unsupported_filters(&names(&["sepia"]), &names(&["sepia"]), &registered),
            names(&["sepia"])
        );
    }
}
