#![deny(missing_docs)]

//! Environment-driven configuration (`spec.md` §6, component O).
//!
//! `Environment`/`AppConfig::from_env()`/`validate()` plus a manual
//! `ConfigError` enum, layered over the `config` crate and `dotenv`
//! (`dotenv::dotenv().ok()` then `config::Config::builder()`) rather than
//! raw `std::env::var` calls.

use std::env;

/// Build a `config::Config` over the process environment. Every lookup in
/// this module reads through this instead of `std::env::var` directly, so
/// a future additional source (a mounted file, a secrets manager) only
/// needs a second `.add_source(...)` here.
fn env_source() -> config::Config {
    config::Config::builder()
        .add_source(config::Environment::default())
        .build()
        .expect("environment config source never fails to build")
}

fn get_string(source: &config::Config, key: &str) -> Option<String> {
    source.get_string(key).ok().or_else(|| env::var(key).ok())
}

/// Which Plaid environment a business's integration talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaidEnv {
    /// Plaid's fully synthetic sandbox.
    Sandbox,
    /// Real institutions, test credentials.
    Development,
    /// Real institutions, real credentials.
    Production,
}

impl PlaidEnv {
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "sandbox" => Ok(PlaidEnv::Sandbox),
            "development" => Ok(PlaidEnv::Development),
            "production" => Ok(PlaidEnv::Production),
            other => Err(ConfigError::InvalidValue("PLAID_ENV", other.to_string())),
        }
    }
}

/// `PLAID_*` configuration group (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct PlaidConfig {
    /// `PLAID_CLIENT_ID`, required only when `use_stub` is false.
    pub client_id: Option<String>,
    /// `PLAID_SECRET`, required only when `use_stub` is false.
    pub secret: Option<String>,
    /// `PLAID_ENV`.
    pub env: PlaidEnv,
    /// `PLAID_BASE_URL`, overrides the default per-`env` Plaid host.
    pub base_url: Option<String>,
    /// `PLAID_WEBHOOK_URL`, registered with Plaid when exchanging tokens.
    pub webhook_url: Option<String>,
    /// `PLAID_ALLOW_PLAINTEXT_TOKENS`: store access tokens unencrypted.
    /// Exists for local development only; never set in a real deployment.
    pub allow_plaintext_tokens: bool,
    /// `PLAID_USE_STUB`: use `fh_providers::StubProviderClient` instead of
    /// a real Plaid client. Defaults to `true` — this pilot has no live
    /// Plaid credentials by default.
    pub use_stub: bool,
    /// `PLAID_WEBHOOK_VERIFY_DISABLED`: skip signature verification
    /// entirely. Local development only.
    pub webhook_verify_disabled: bool,
}

impl PlaidConfig {
    fn from_env(source: &config::Config) -> Result<Self, ConfigError> {
        let use_stub = bool_env(source, "PLAID_USE_STUB", true);
        let config = PlaidConfig {
            client_id: get_string(source, "PLAID_CLIENT_ID"),
            secret: get_string(source, "PLAID_SECRET"),
            env: get_string(source, "PLAID_ENV").map(|s| PlaidEnv::from_str(&s)).unwrap_or(Ok(PlaidEnv::Sandbox))?,
            base_url: get_string(source, "PLAID_BASE_URL"),
            webhook_url: get_string(source, "PLAID_WEBHOOK_URL"),
            allow_plaintext_tokens: bool_env(source, "PLAID_ALLOW_PLAINTEXT_TOKENS", false),
            use_stub,
            webhook_verify_disabled: bool_env(source, "PLAID_WEBHOOK_VERIFY_DISABLED", false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.use_stub && (self.client_id.is_none() || self.secret.is_none()) {
            return Err(ConfigError::MissingCredential("PLAID_CLIENT_ID/PLAID_SECRET (PLAID_USE_STUB is false)"));
        }
        Ok(())
    }
}

/// Whole-process configuration, loaded once in `apps/server`'s `main` and
/// threaded through as a shared `Arc<AppConfig>` (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `DATABASE_URL`.
    pub database_url: String,
    /// `CORS_ALLOW_ORIGINS`, comma-separated, trimmed, empty entries dropped.
    pub cors_allow_origins: Vec<String>,
    /// `PILOT_DEV_MODE`.
    pub pilot_dev_mode: bool,
    /// `ALLOW_BUSINESS_DELETE`.
    pub allow_business_delete: bool,
    /// `CLARITY_DEV_TOOLS`.
    pub clarity_dev_tools: bool,
    /// `DEV_INTEGRATION_OPS`.
    pub dev_integration_ops: bool,
    /// `DEV_PROCESSING_OPS`.
    pub dev_processing_ops: bool,
    /// `PLAID_*` group.
    pub plaid: PlaidConfig,
}

impl AppConfig {
    /// Load from the process environment, having first loaded a `.env`
    /// file if present (`dotenv::dotenv().ok()` — missing is not an error).
    /// Booleans parse `"1"`/`"true"`/`"yes"` case-insensitively as true,
    /// anything else (including unset) as false.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let source = env_source();

        let database_url = get_string(&source, "DATABASE_URL").ok_or(ConfigError::MissingCredential("DATABASE_URL"))?;
        let cors_allow_origins = get_string(&source, "CORS_ALLOW_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let app_config = AppConfig {
            database_url,
            cors_allow_origins,
            pilot_dev_mode: bool_env(&source, "PILOT_DEV_MODE", false),
            allow_business_delete: bool_env(&source, "ALLOW_BUSINESS_DELETE", false),
            clarity_dev_tools: bool_env(&source, "CLARITY_DEV_TOOLS", false),
            dev_integration_ops: bool_env(&source, "DEV_INTEGRATION_OPS", false),
            dev_processing_ops: bool_env(&source, "DEV_PROCESSING_OPS", false),
            plaid: PlaidConfig::from_env(&source)?,
        };
        app_config.validate()?;
        Ok(app_config)
    }

    /// Sanity-check the loaded configuration beyond what per-field parsing
    /// already enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL", "empty".to_string()));
        }
        self.plaid.validate()
    }
}

fn bool_env(source: &config::Config, key: &str, default: bool) -> bool {
    match get_string(source, key) {
        Some(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

/// Configuration load/validation failure. `apps/server`'s `main` treats any
/// of these as fatal and exits before binding a socket.
#[derive(Debug)]
pub enum ConfigError {
    /// A required environment variable was not set.
    MissingCredential(&'static str),
    /// A variable was set but failed validation.
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingCredential(key) => write!(f, "missing required environment variable: {key}"),
            ConfigError::InvalidValue(key, detail) => write!(f, "invalid value for {key}: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn bool_env_accepts_common_truthy_spellings() {
        let _guard = ENV_LOCK.lock().unwrap();
        for value in ["1", "true", "TRUE", "yes", "Yes"] {
            env::set_var("FH_TEST_FLAG", value);
            assert!(bool_env(&env_source(), "FH_TEST_FLAG", false), "expected {value} to parse true");
        }
        for value in ["0", "false", "no"] {
            env::set_var("FH_TEST_FLAG", value);
            assert!(!bool_env(&env_source(), "FH_TEST_FLAG", false), "expected {value} to parse false");
        }
        env::remove_var("FH_TEST_FLAG");
    }

    #[test]
    fn bool_env_defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("FH_TEST_FLAG_UNSET");
        assert!(bool_env(&env_source(), "FH_TEST_FLAG_UNSET", true));
        assert!(!bool_env(&env_source(), "FH_TEST_FLAG_UNSET", false));
    }

    #[test]
    fn plaid_env_parses_case_insensitively() {
        assert_eq!(PlaidEnv::from_str("Sandbox").unwrap(), PlaidEnv::Sandbox);
        assert!(PlaidEnv::from_str("nonsense").is_err());
    }
}
