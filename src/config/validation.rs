//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse: the raw TOML is first walked as a `toml::Value` tree and
//! every key compared against the known field names, then normal serde
//! deserialization runs. Warnings never break an otherwise valid config.

use std::collections::HashSet;

/// A non-fatal config warning (typo, unknown section).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path for `RouterConfig`.
///
/// Array-of-table entries (`[[catalog.models]]`) are listed under the array
/// name. Must be kept in step with `router_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [server]
        "server",
        "server.addr",
        "server.cors_origins",
        "server.request_body_limit_kb",
        // [storage]
        "storage",
        "storage.data_dir",
        "storage.snapshot_retention_days",
        "storage.prune_interval_secs",
        // [scheduler]
        "scheduler",
        "scheduler.default_timeout_secs",
        "scheduler.aging_step_secs",
        "scheduler.aging_max_boost",
        "scheduler.aging_sweep_interval_secs",
        "scheduler.retry_tick_secs",
        "scheduler.trigger_debounce_ms",
        "scheduler.failover",
        "scheduler.failover.enabled",
        "scheduler.failover.max_attempts",
        // [capacity]
        "capacity",
        "capacity.poll_interval_secs",
        "capacity.quota_poll_interval_secs",
        "capacity.probe_timeout_secs",
        "capacity.stale_after_secs",
        "capacity.unknown_footprint_margin_mb",
        "capacity.reconcile_interval_secs",
        // [ledger]
        "ledger",
        "ledger.retry_max_attempts",
        "ledger.retry_base_ms",
        "ledger.retry_max_ms",
        "ledger.latest_limit_max",
        // [feed]
        "feed",
        "feed.latest_interval_ms",
        "feed.capacity_interval_ms",
        "feed.batch_limit",
        // [catalog]
        "catalog",
        "catalog.providers",
        "catalog.providers.id",
        "catalog.providers.name",
        "catalog.providers.kind",
        "catalog.providers.base_url",
        "catalog.providers.credential_ref",
        "catalog.providers.capacity_mb",
        "catalog.models",
        "catalog.models.id",
        "catalog.models.provider_id",
        "catalog.models.endpoint_path",
        "catalog.models.tags",
        "catalog.models.max_parallel",
        "catalog.models.privacy",
        "catalog.models.footprint_mb",
        "catalog.models.better_than",
        "catalog.models.better_than.latency",
        "catalog.models.better_than.accuracy",
        "catalog.models.better_than.cost",
        "catalog.models.better_than.quality",
        "catalog.policies",
        "catalog.policies.id",
        "catalog.policies.owner_id",
        "catalog.policies.name",
        "catalog.policies.description",
        "catalog.policies.thresholds",
        "catalog.policies.thresholds.latency",
        "catalog.policies.thresholds.accuracy",
        "catalog.policies.thresholds.cost",
        "catalog.policies.thresholds.quality",
        "catalog.policies.max_privacy",
        "catalog.policies.priority",
        "catalog.policies.topic",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walk a `toml::Value` tree and collect all dotted key paths.
///
/// A table `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`. Tables
/// inside arrays are walked under the array's own path.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            match v {
                toml::Value::Table(_) => keys.extend(walk_toml_keys(v, &path)),
                toml::Value::Array(items) => {
                    for item in items.iter().filter(|i| i.is_table()) {
                        keys.extend(walk_toml_keys(item, &path));
                    }
                }
                _ => {}
            }
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Closest known key within edit distance 3. Ties go to the
/// lexicographically smaller key so suggestions are stable.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (levenshtein(unknown, k), k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse raw TOML and return a warning for every unknown key.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        // Parse errors surface from serde afterwards
        Err(_) => return Vec::new(),
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("hello", "hello"), 0);
        assert_eq!(levenshtein("retry_tik_secs", "retry_tick_secs"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested_and_arrays() {
        let toml: toml::Value = r#"
            [scheduler.failover]
            enabled = true

            [[catalog.models]]
            id = "a"

            [[catalog.models]]
            id = "b"
            [catalog.models.better_than]
            latency = "a"
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"scheduler.failover.enabled".to_string()));
        assert!(keys.contains(&"catalog.models.id".to_string()));
        assert!(keys.contains(&"catalog.models.better_than.latency".to_string()));
        assert_eq!(keys.iter().filter(|k| *k == "catalog.models.id").count(), 1);
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
[capacity]
pol_interval_secs = 5
"#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "capacity.pol_interval_secs");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("capacity.poll_interval_secs")
        );
    }

    #[test]
    fn test_valid_keys_produce_no_warnings() {
        let warnings = validate_unknown_keys(
            r#"
[server]
addr = "127.0.0.1:9000"

[ledger]
retry_max_attempts = 3

[[catalog.policies]]
id = "p"
owner_id = "o"
name = "n"
max_privacy = "local"
topic = "*"
"#,
        );
        assert!(warnings.is_empty(), "Expected 0 warnings, got: {:?}", warnings);
    }

    #[test]
    fn test_unknown_section_has_no_suggestion() {
        let warnings = validate_unknown_keys("[completely_unrelated]\nx = 1\n");
        assert!(!warnings.is_empty());
        assert!(warnings.iter().all(|w| w.suggestion.is_none()));
    }
}
