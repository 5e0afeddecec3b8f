//! Layered configuration for the idempotency layer.
//!
//! Values resolve in order: built-in defaults, a TOML or JSON file, the
//! `BASEKIT_IDEMPOTENCY_*` environment variables, then CLI overrides. The
//! resolver records which layer last set each field.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backoff::{BackoffStrategy, RetryPolicy};
use crate::cache::{DEFAULT_TTL, REVOKE_TTL, ROTATE_TTL};
use crate::error::{IdempotencyError, Result};
use crate::executor::ErrorCaching;
use crate::key::IDEMPOTENCY_KEY_HEADER;
use crate::sqlite::SqliteResponseStore;
use crate::store::{InMemoryResponseStore, ResponseStore};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "BASEKIT_IDEMPOTENCY_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Opens the configured backend.
    pub fn open(&self) -> Result<Arc<dyn ResponseStore>> {
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryResponseStore::new())),
            StoreBackend::Sqlite => {
                let path = self.path.as_deref().ok_or_else(|| {
                    IdempotencyError::Config("store.path is required for the sqlite backend".into())
                })?;
                let store =
                    SqliteResponseStore::open(path, Duration::from_millis(self.busy_timeout_ms))?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::default(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            strategy: self.strategy,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub header_name: String,
    pub default_ttl_secs: u64,
    pub fail_open: bool,
    pub error_caching: ErrorCaching,
    /// TTL in seconds keyed by operation prefix.
    pub operations: BTreeMap<String, u64>,
    pub store: StoreConfig,
    pub sweeper: SweeperConfig,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            fail_open: true,
            error_caching: ErrorCaching::default(),
            operations: BTreeMap::from([
                ("rotate".to_string(), ROTATE_TTL.as_secs()),
                ("revoke".to_string(), REVOKE_TTL.as_secs()),
            ]),
            store: StoreConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.header_name.trim().is_empty() {
            errors.push("header_name must not be empty".to_string());
        } else if self.header_name.chars().any(|c| c.is_whitespace() || c == ':') {
            errors.push("header_name must not contain whitespace or ':'".to_string());
        }
        if self.default_ttl_secs == 0 {
            errors.push("default_ttl_secs must be greater than zero".to_string());
        }
        for (prefix, ttl) in &self.operations {
            if prefix.trim().is_empty() {
                errors.push("operations keys must not be empty".to_string());
            }
            if *ttl == 0 {
                errors.push(format!("operations.{prefix} must be greater than zero"));
            }
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            errors.push("store.path is required for the sqlite backend".to_string());
        }
        if self.sweeper.interval_secs == 0 {
            errors.push("sweeper.interval_secs must be greater than zero".to_string());
        }
        if self.sweeper.base_delay_ms > self.sweeper.max_delay_ms {
            errors.push("sweeper.base_delay_ms must not exceed sweeper.max_delay_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IdempotencyError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreLayer {
    pub backend: Option<StoreBackend>,
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweeperLayer {
    pub interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub strategy: Option<BackoffStrategy>,
}

/// A partial configuration contributed by one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub header_name: Option<String>,
    pub default_ttl_secs: Option<u64>,
    pub fail_open: Option<bool>,
    pub error_caching: Option<ErrorCaching>,
    /// Merged entry by entry over lower layers.
    pub operations: Option<BTreeMap<String, u64>>,
    pub store: Option<StoreLayer>,
    pub sweeper: Option<SweeperLayer>,
}

impl ConfigLayer {
    /// Reads a layer from a `.json` file, or TOML for any other extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            IdempotencyError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|err| err.to_string()),
            _ => toml::from_str(&contents).map_err(|err| err.to_string()),
        };
        parsed.map_err(|err| {
            IdempotencyError::Config(format!("{} is not a valid config: {err}", path.display()))
        })
    }

    /// Builds a layer from `BASEKIT_IDEMPOTENCY_*` variables.
    pub fn from_env_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut layer = Self::default();
        for (name, value) in vars {
            let Some(field) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match field {
                "HEADER_NAME" => layer.header_name = Some(value.to_string()),
                "DEFAULT_TTL_SECS" => layer.default_ttl_secs = Some(parse_env(field, value)?),
                "FAIL_OPEN" => layer.fail_open = Some(parse_bool(field, value)?),
                "ERROR_CACHING" => layer.error_caching = Some(parse_enum(field, value)?),
                "STORE_BACKEND" => store_layer(&mut layer).backend = Some(parse_enum(field, value)?),
                "STORE_PATH" => store_layer(&mut layer).path = Some(PathBuf::from(value)),
                "STORE_BUSY_TIMEOUT_MS" => {
                    store_layer(&mut layer).busy_timeout_ms = Some(parse_env(field, value)?)
                }
                "SWEEPER_INTERVAL_SECS" => {
                    sweeper_layer(&mut layer).interval_secs = Some(parse_env(field, value)?)
                }
                "SWEEPER_MAX_RETRIES" => {
                    sweeper_layer(&mut layer).max_retries = Some(parse_env(field, value)?)
                }
                other => {
                    if let Some(prefix) = other.strip_prefix("OPERATION_TTL_") {
                        layer
                            .operations
                            .get_or_insert_with(BTreeMap::new)
                            .insert(prefix.to_ascii_lowercase(), parse_env(field, value)?);
                    } else {
                        tracing::warn!(variable = %name.as_ref(), "ignoring unknown config variable");
                    }
                }
            }
        }
        Ok(layer)
    }
}

fn store_layer(layer: &mut ConfigLayer) -> &mut StoreLayer {
    layer.store.get_or_insert_with(StoreLayer::default)
}

fn sweeper_layer(layer: &mut ConfigLayer) -> &mut SweeperLayer {
    layer.sweeper.get_or_insert_with(SweeperLayer::default)
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| IdempotencyError::Config(format!("{ENV_PREFIX}{field}: {err}")))
}

fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(IdempotencyError::Config(format!(
            "{ENV_PREFIX}{field}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_enum<T: for<'de> Deserialize<'de>>(field: &str, value: &str) -> Result<T> {
    serde_json::from_value(Value::String(value.trim().to_ascii_lowercase()))
        .map_err(|err| IdempotencyError::Config(format!("{ENV_PREFIX}{field}: {err}")))
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    Cli,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: IdempotencyConfig,
    /// Dotted field path to the layer that set it. Absent paths are defaults.
    pub provenance: BTreeMap<String, ConfigSource>,
    pub warnings: Vec<String>,
}

impl ResolvedConfig {
    pub fn source_of(&self, path: &str) -> ConfigSource {
        self.provenance
            .get(path)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }
}

/// Merges configuration layers in precedence order.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    file: Option<PathBuf>,
    env: Option<Vec<(String, String)>>,
    cli: Option<ConfigLayer>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Replaces the process environment with explicit variables.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_cli_overrides(mut self, layer: ConfigLayer) -> Self {
        self.cli = Some(layer);
        self
    }

    pub fn load(self) -> Result<ResolvedConfig> {
        let mut config = IdempotencyConfig::default();
        let mut provenance = BTreeMap::new();

        if let Some(path) = &self.file {
            let layer = ConfigLayer::from_file(path)?;
            apply_layer(&mut config, &mut provenance, layer, ConfigSource::File);
        }

        let env_layer = match self.env {
            Some(vars) => ConfigLayer::from_env_vars(vars)?,
            None => ConfigLayer::from_env_vars(std::env::vars())?,
        };
        apply_layer(&mut config, &mut provenance, env_layer, ConfigSource::Environment);

        if let Some(layer) = self.cli {
            apply_layer(&mut config, &mut provenance, layer, ConfigSource::Cli);
        }

        config.validate()?;
        let warnings = collect_warnings(&config);
        Ok(ResolvedConfig {
            config,
            provenance,
            warnings,
        })
    }
}

fn set<T>(
    target: &mut T,
    value: Option<T>,
    path: &str,
    source: ConfigSource,
    provenance: &mut BTreeMap<String, ConfigSource>,
) {
    if let Some(value) = value {
        *target = value;
        provenance.insert(path.to_string(), source);
    }
}

fn apply_layer(
    config: &mut IdempotencyConfig,
    provenance: &mut BTreeMap<String, ConfigSource>,
    layer: ConfigLayer,
    source: ConfigSource,
) {
    set(&mut config.header_name, layer.header_name, "header_name", source, provenance);
    set(
        &mut config.default_ttl_secs,
        layer.default_ttl_secs,
        "default_ttl_secs",
        source,
        provenance,
    );
    set(&mut config.fail_open, layer.fail_open, "fail_open", source, provenance);
    set(
        &mut config.error_caching,
        layer.error_caching,
        "error_caching",
        source,
        provenance,
    );

    for (prefix, ttl) in layer.operations.unwrap_or_default() {
        provenance.insert(format!("operations.{prefix}"), source);
        config.operations.insert(prefix, ttl);
    }

    if let Some(store) = layer.store {
        set(&mut config.store.backend, store.backend, "store.backend", source, provenance);
        if let Some(path) = store.path {
            set(&mut config.store.path, Some(Some(path)), "store.path", source, provenance);
        }
        set(
            &mut config.store.busy_timeout_ms,
            store.busy_timeout_ms,
            "store.busy_timeout_ms",
            source,
            provenance,
        );
    }

    if let Some(sweeper) = layer.sweeper {
        set(
            &mut config.sweeper.interval_secs,
            sweeper.interval_secs,
            "sweeper.interval_secs",
            source,
            provenance,
        );
        set(
            &mut config.sweeper.max_retries,
            sweeper.max_retries,
            "sweeper.max_retries",
            source,
            provenance,
        );
        set(
            &mut config.sweeper.base_delay_ms,
            sweeper.base_delay_ms,
            "sweeper.base_delay_ms",
            source,
            provenance,
        );
        set(
            &mut config.sweeper.max_delay_ms,
            sweeper.max_delay_ms,
            "sweeper.max_delay_ms",
            source,
            provenance,
        );
        set(
            &mut config.sweeper.strategy,
            sweeper.strategy,
            "sweeper.strategy",
            source,
            provenance,
        );
    }
}

fn collect_warnings(config: &IdempotencyConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if !config.fail_open {
        warnings.push(
            "fail_open is disabled: a store outage rejects every idempotent request".to_string(),
        );
    }
    if config.error_caching == ErrorCaching::Always {
        warnings.push(
            "error_caching = always: 5xx responses are replayed to retrying clients until they expire"
                .to_string(),
        );
    }
    if config.store.backend == StoreBackend::Memory {
        warnings.push(
            "memory store is process-local: replays are not shared between instances".to_string(),
        );
    }
    warnings
}

/// Human and machine readable description of a resolved config.
pub struct ExplainReport {
    pub text: String,
    pub json: Value,
}

pub fn explain(resolved: &ResolvedConfig) -> ExplainReport {
    let mut text = String::from("Overridden settings:\n");
    if resolved.provenance.is_empty() {
        text.push_str("  (none, all defaults)\n");
    }
    for (path, source) in &resolved.provenance {
        text.push_str(&format!("  {path} <- {source:?}\n"));
    }
    if !resolved.warnings.is_empty() {
        text.push_str("Warnings:\n");
        for warning in &resolved.warnings {
            text.push_str(&format!("  - {warning}\n"));
        }
    }

    let json = json!({
        "config": resolved.config,
        "provenance": resolved.provenance,
        "warnings": resolved.warnings,
    });
    ExplainReport { text, json }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = IdempotencyConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.operations["rotate"], 300);
        assert_eq!(config.operations["revoke"], 31_536_000);
    }

    #[test]
    fn sqlite_without_path_is_rejected() {
        let mut config = IdempotencyConfig::default();
        config.store.backend = StoreBackend::Sqlite;
        config.default_ttl_secs = 0;
        let err = config.validate().expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("store.path"), "{message}");
        assert!(message.contains("default_ttl_secs"), "{message}");
    }

    #[test]
    fn env_layer_parses_known_variables() {
        let layer = ConfigLayer::from_env_vars([
            ("BASEKIT_IDEMPOTENCY_FAIL_OPEN", "false"),
            ("BASEKIT_IDEMPOTENCY_ERROR_CACHING", "client_errors"),
            ("BASEKIT_IDEMPOTENCY_STORE_BACKEND", "SQLITE"),
            ("BASEKIT_IDEMPOTENCY_OPERATION_TTL_PROVISION", "120"),
            ("UNRELATED", "x"),
        ])
        .unwrap();
        assert_eq!(layer.fail_open, Some(false));
        assert_eq!(layer.error_caching, Some(ErrorCaching::ClientErrors));
        assert_eq!(
            layer.store.and_then(|store| store.backend),
            Some(StoreBackend::Sqlite)
        );
        assert_eq!(layer.operations.unwrap()["provision"], 120);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let err = ConfigLayer::from_env_vars([("BASEKIT_IDEMPOTENCY_DEFAULT_TTL_SECS", "soon")])
            .expect_err("not a number");
        assert!(err.to_string().contains("DEFAULT_TTL_SECS"));
    }
}
