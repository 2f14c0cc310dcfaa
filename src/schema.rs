// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload schema validation.
//!
//! The validator holds a set of compiled JSON Schemas keyed by schema id
//! (`name/MAJOR.MINOR`) and validates decoded payloads against them.
//! Results are cached by payload content hash in an LRU cache so repeated
//! identical payloads (retained republish, periodic state) skip
//! revalidation.
//!
//! Validation never gates liveness: LWT handling and topic-level identity
//! extraction happen before any schema check.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::PayloadError;

/// Default capacity of the validation result cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// How schema violations affect message flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Violations reject the payload (`PayloadRejected`).
    Strict,
    /// Violations are logged; the record flows through with a marker.
    #[default]
    Lenient,
}

/// Outcome of validating one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The payload satisfies the registered schema.
    Valid,
    /// The payload violates the registered schema.
    Invalid(Vec<String>),
    /// No schema is registered under this id.
    UnknownSchema,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Validations answered from the cache.
    pub hits: u64,
    /// Validations that ran the compiled schema.
    pub misses: u64,
}

/// Validates payloads against a registered schema set.
pub struct SchemaValidator {
    validators: RwLock<HashMap<String, Arc<jsonschema::Validator>>>,
    cache: Mutex<LruCache<(String, u64), Arc<Vec<String>>>>,
    mode: ValidationMode,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schemas", &self.validators.read().len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    /// Creates a validator with the default cache capacity.
    #[must_use]
    pub fn new(mode: ValidationMode) -> Self {
        Self::with_cache_capacity(mode, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates a validator with a custom cache capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_cache_capacity(mode: ValidationMode, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            validators: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(capacity)),
            mode,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the configured mode.
    #[must_use]
    pub const fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Registers (or replaces) a schema definition.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::SchemaCompile`] if the definition is not a
    /// valid JSON Schema.
    pub fn register(
        &self,
        schema_id: impl Into<String>,
        definition: &Value,
    ) -> Result<(), PayloadError> {
        let schema_id = schema_id.into();
        let validator =
            jsonschema::validator_for(definition).map_err(|e| PayloadError::SchemaCompile {
                schema: schema_id.clone(),
                message: e.to_string(),
            })?;

        tracing::debug!(schema = %schema_id, "Registered payload schema");
        self.validators
            .write()
            .insert(schema_id, Arc::new(validator));
        Ok(())
    }

    /// Returns the number of registered schemas.
    #[must_use]
    pub fn schema_count(&self) -> usize {
        self.validators.read().len()
    }

    /// Validates a payload against the schema registered under `schema_id`.
    #[must_use]
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Validation {
        let validator = {
            let validators = self.validators.read();
            match validators.get(schema_id) {
                Some(v) => Arc::clone(v),
                None => return Validation::UnknownSchema,
            }
        };

        let key = (schema_id.to_string(), content_hash(payload));
        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return if cached.is_empty() {
                Validation::Valid
            } else {
                Validation::Invalid(cached.as_ref().clone())
            };
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let violations: Vec<String> = validator
            .iter_errors(payload)
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect();

        self.cache
            .lock()
            .put(key, Arc::new(violations.clone()));

        if violations.is_empty() {
            Validation::Valid
        } else {
            Validation::Invalid(violations)
        }
    }

    /// Validates for the ingest path, applying the configured mode.
    ///
    /// Returns the `has_validation_errors` marker: `false` for valid or
    /// unregistered schemas, `true` for lenient-mode violations.
    ///
    /// # Errors
    ///
    /// In strict mode, violations convert to [`PayloadError::Rejected`].
    pub fn check(&self, schema_id: &str, payload: &Value) -> Result<bool, PayloadError> {
        match self.validate(schema_id, payload) {
            Validation::Valid | Validation::UnknownSchema => Ok(false),
            Validation::Invalid(violations) => match self.mode {
                ValidationMode::Strict => Err(PayloadError::Rejected {
                    schema: schema_id.to_string(),
                    violations,
                }),
                ValidationMode::Lenient => {
                    tracing::warn!(
                        schema = %schema_id,
                        violations = violations.len(),
                        "Payload failed schema validation, passing through"
                    );
                    Ok(true)
                }
            },
        }
    }

    /// Returns cache hit/miss counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Hashes a payload's canonical JSON text.
fn content_hash(payload: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "health": {"type": "string"},
                "uptime_s": {"type": "integer", "minimum": 0},
                "cpu_usage": {"type": "number", "minimum": 0, "maximum": 100}
            },
            "required": ["health"]
        })
    }

    #[test]
    fn validate_ok() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        v.register("state/1.0", &state_schema()).unwrap();

        let outcome = v.validate("state/1.0", &json!({"health": "ok", "uptime_s": 10}));
        assert_eq!(outcome, Validation::Valid);
    }

    #[test]
    fn validate_violations() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        v.register("state/1.0", &state_schema()).unwrap();

        let outcome = v.validate("state/1.0", &json!({"uptime_s": -5}));
        let Validation::Invalid(violations) = outcome else {
            panic!("expected violations");
        };
        // Missing "health" and negative uptime.
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn validate_unknown_schema() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        assert_eq!(
            v.validate("nope/1.0", &json!({})),
            Validation::UnknownSchema
        );
    }

    #[test]
    fn register_rejects_bad_definition() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        let err = v
            .register("bad/1.0", &json!({"type": "not-a-type"}))
            .unwrap_err();
        assert!(matches!(err, PayloadError::SchemaCompile { .. }));
    }

    #[test]
    fn cache_hits_on_repeat() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        v.register("state/1.0", &state_schema()).unwrap();

        let payload = json!({"health": "ok"});
        assert_eq!(v.validate("state/1.0", &payload), Validation::Valid);
        assert_eq!(v.validate("state/1.0", &payload), Validation::Valid);
        assert_eq!(v.validate("state/1.0", &payload), Validation::Valid);

        let stats = v.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn cache_caches_violations_too() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        v.register("state/1.0", &state_schema()).unwrap();

        let bad = json!({});
        assert!(matches!(
            v.validate("state/1.0", &bad),
            Validation::Invalid(_)
        ));
        assert!(matches!(
            v.validate("state/1.0", &bad),
            Validation::Invalid(_)
        ));
        assert_eq!(v.cache_stats().hits, 1);
    }

    #[test]
    fn cache_evicts_at_capacity() {
        let v = SchemaValidator::with_cache_capacity(ValidationMode::Lenient, 2);
        v.register("state/1.0", &state_schema()).unwrap();

        let a = json!({"health": "a"});
        let b = json!({"health": "b"});
        let c = json!({"health": "c"});
        v.validate("state/1.0", &a);
        v.validate("state/1.0", &b);
        v.validate("state/1.0", &c); // evicts a
        v.validate("state/1.0", &a); // miss again

        assert_eq!(v.cache_stats().misses, 4);
        assert_eq!(v.cache_stats().hits, 0);
    }

    #[test]
    fn check_strict_rejects() {
        let v = SchemaValidator::new(ValidationMode::Strict);
        v.register("state/1.0", &state_schema()).unwrap();

        let err = v.check("state/1.0", &json!({})).unwrap_err();
        assert!(matches!(err, PayloadError::Rejected { .. }));
    }

    #[test]
    fn check_lenient_marks() {
        let v = SchemaValidator::new(ValidationMode::Lenient);
        v.register("state/1.0", &state_schema()).unwrap();

        assert!(v.check("state/1.0", &json!({})).unwrap());
        assert!(!v.check("state/1.0", &json!({"health": "ok"})).unwrap());
    }

    #[test]
    fn check_unknown_schema_flows_through() {
        let v = SchemaValidator::new(ValidationMode::Strict);
        assert!(!v.check("unregistered/1.0", &json!({})).unwrap());
    }
}
