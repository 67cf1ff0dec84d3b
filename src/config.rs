/*
 * Responsibility
 * - Load settings from the environment (.env included) once at startup
 * - Validate them (startup fails on missing or malformed values)
 * - Hand typed sub-configs to each component by reference
 */
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use thiserror::Error;

use crate::services::auth::RequiredClaim;
use crate::services::breaker::CircuitBreakerConfig;
use crate::services::ratelimit::LimitDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(value: Option<String>) -> Self {
        match value
            .unwrap_or_else(|| "development".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("APP_ENV").ok())
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),
    #[error("invalid configuration: {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            key,
            reason: reason.to_string(),
        }
    }
}

/// What to do when a dependency (storage, revocation service) cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Let the request through
    #[default]
    FailOpen,
    /// Refuse the request
    FailClosed,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "closed" => Ok(Self::FailClosed),
            other => Err(format!("expected fail-open or fail-closed, got `{other}`")),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FailOpen => "fail-open",
            Self::FailClosed => "fail-closed",
        })
    }
}

/// Token verification key.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Shared secret for HS* algorithms
    Secret(String),
    /// PEM public key for RS*/PS*/ES*/EdDSA
    PublicKeyPem(String),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
            Self::PublicKeyPem(_) => f.write_str("PublicKeyPem(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RevocationBackend {
    /// Fixed list; empty means nothing is ever revoked
    Static(Vec<String>),
    Http { url: String, timeout: Duration },
    Valkey { url: String, prefix: String },
}

#[derive(Debug, Clone)]
pub struct RevocationConfig {
    pub backend: RevocationBackend,
    pub cache_ttl: Duration,
    pub timeout: Duration,
    pub failure_mode: FailureMode,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            backend: RevocationBackend::Static(Vec::new()),
            cache_ttl: Duration::from_secs(30),
            timeout: Duration::from_millis(500),
            failure_mode: FailureMode::FailOpen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationConfig {
    pub cookie_name: String,
    pub allow_bearer: bool,
    pub algorithm: Algorithm,
    pub key: KeyMaterial,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub clock_skew: Duration,
    pub required_claims: Vec<RequiredClaim>,
    pub decision_cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub revocation: RevocationConfig,
}

impl AuthorizationConfig {
    /// HS256 with the given secret and defaults for everything else.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            cookie_name: "session".to_string(),
            allow_bearer: false,
            algorithm: Algorithm::HS256,
            key: KeyMaterial::Secret(secret.into()),
            issuer: None,
            audience: None,
            clock_skew: Duration::from_secs(30),
            required_claims: vec![RequiredClaim::UserId, RequiredClaim::SessionId],
            decision_cache_ttl: Duration::from_secs(60),
            cache_sweep_interval: Duration::from_secs(60),
            revocation: RevocationConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    Memory { sweep_interval: Duration },
    Redis { url: String },
    DynamoDb {
        table: String,
        consistent_read: bool,
        /// Length of the time window each item covers.
        window: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: StorageBackendConfig,
    pub failure_mode: FailureMode,
    pub fail_closed_retry_after: Duration,
    pub storage_timeout: Duration,
    pub key_prefix: String,
    /// Applied to every routed request, before route limits.
    pub global_limits: Vec<LimitDefinition>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: StorageBackendConfig::Memory {
                sweep_interval: Duration::from_secs(60),
            },
            failure_mode: FailureMode::FailOpen,
            fail_closed_retry_after: Duration::from_secs(1),
            storage_timeout: Duration::from_millis(100),
            key_prefix: "rl".to_string(),
            global_limits: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,
    pub request_timeout: Duration,
    pub body_limit_bytes: usize,
    /// Take the client ip from `X-Forwarded-For` (only behind a trusted proxy)
    pub trust_forwarded_for: bool,
    pub routes_file: String,

    pub auth: AuthorizationConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: CircuitBreakerConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let port: u16 = env.parse("PORT")?.unwrap_or(3000);
        let addr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|e| ConfigError::invalid("PORT", e))?;

        Ok(Self {
            addr,
            app_env: AppEnv::parse(env.get("APP_ENV")),
            request_timeout: env.millis("REQUEST_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(30)),
            body_limit_bytes: env.parse("BODY_LIMIT_BYTES")?.unwrap_or(1024 * 1024),
            trust_forwarded_for: env.flag("TRUST_FORWARDED_FOR")?.unwrap_or(false),
            routes_file: env
                .get("GATEWAY_ROUTES_FILE")
                .ok_or(ConfigError::Missing("GATEWAY_ROUTES_FILE"))?,
            auth: auth_config(&env)?,
            rate_limit: rate_limit_config(&env)?,
            breaker: breaker_config(&env)?,
            upstream: UpstreamConfig {
                timeout: env
                    .millis("UPSTREAM_TIMEOUT_MS")?
                    .unwrap_or(UpstreamConfig::default().timeout),
            },
        })
    }
}

fn auth_config<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
) -> Result<AuthorizationConfig, ConfigError> {
    let algorithm = match env.get("AUTH_JWT_ALGORITHM") {
        Some(raw) => Algorithm::from_str(raw.trim())
            .map_err(|e| ConfigError::invalid("AUTH_JWT_ALGORITHM", e))?,
        None => Algorithm::HS256,
    };

    let key = match (env.get("AUTH_JWT_SECRET"), env.get("AUTH_JWT_PUBLIC_KEY_PEM")) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                "AUTH_JWT_SECRET",
                "set either AUTH_JWT_SECRET or AUTH_JWT_PUBLIC_KEY_PEM, not both",
            ));
        }
        (Some(secret), None) if secret.is_empty() => {
            return Err(ConfigError::invalid("AUTH_JWT_SECRET", "must not be empty"));
        }
        (Some(secret), None) => KeyMaterial::Secret(secret),
        // PEM in a single-line env var
        (None, Some(pem)) => KeyMaterial::PublicKeyPem(pem.replace("\\n", "\n")),
        (None, None) => return Err(ConfigError::Missing("AUTH_JWT_SECRET")),
    };

    let mut config = AuthorizationConfig::with_secret(String::new());
    config.algorithm = algorithm;
    config.key = key;

    if let Some(name) = env.get("AUTH_COOKIE_NAME") {
        config.cookie_name = name;
    }
    config.allow_bearer = env.flag("AUTH_ALLOW_BEARER")?.unwrap_or(false);
    config.issuer = env.get("AUTH_ISSUER").filter(|s| !s.is_empty());
    config.audience = env.get("AUTH_AUDIENCE").filter(|s| !s.is_empty());
    if let Some(skew) = env.secs("AUTH_CLOCK_SKEW_SECONDS")? {
        config.clock_skew = skew;
    }
    if let Some(raw) = env.get("AUTH_REQUIRED_CLAIMS") {
        config.required_claims = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(RequiredClaim::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::invalid("AUTH_REQUIRED_CLAIMS", e))?;
    }
    if let Some(ttl) = env.secs("AUTH_DECISION_CACHE_TTL_SECONDS")? {
        config.decision_cache_ttl = ttl;
    }
    if let Some(period) = env.secs("AUTH_CACHE_SWEEP_INTERVAL_SECONDS")? {
        config.cache_sweep_interval = period;
    }

    let mut revocation = RevocationConfig::default();
    if let Some(ttl) = env.secs("AUTH_REVOCATION_CACHE_TTL_SECONDS")? {
        revocation.cache_ttl = ttl;
    }
    if let Some(timeout) = env.millis("AUTH_REVOCATION_TIMEOUT_MS")? {
        revocation.timeout = timeout;
    }
    if let Some(mode) = env.parse::<FailureMode>("AUTH_REVOCATION_FAILURE_MODE")? {
        revocation.failure_mode = mode;
    }
    revocation.backend = match (
        env.get("AUTH_REVOCATION_URL"),
        env.get("AUTH_REVOCATION_VALKEY_URL"),
    ) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                "AUTH_REVOCATION_URL",
                "set either AUTH_REVOCATION_URL or AUTH_REVOCATION_VALKEY_URL, not both",
            ));
        }
        (Some(url), None) => RevocationBackend::Http {
            url,
            timeout: revocation.timeout,
        },
        (None, Some(url)) => RevocationBackend::Valkey {
            url,
            prefix: env
                .get("AUTH_REVOCATION_VALKEY_PREFIX")
                .unwrap_or_else(|| "session:revoked".to_string()),
        },
        (None, None) => RevocationBackend::Static(
            env.get("AUTH_REVOKED_SESSIONS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
    };
    config.revocation = revocation;

    Ok(config)
}

fn rate_limit_config<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
) -> Result<RateLimitConfig, ConfigError> {
    let defaults = RateLimitConfig::default();

    let backend = match env
        .get("RATE_LIMIT_BACKEND")
        .unwrap_or_else(|| "memory".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "memory" => StorageBackendConfig::Memory {
            sweep_interval: env
                .secs("RATE_LIMIT_SWEEP_INTERVAL_SECONDS")?
                .unwrap_or(Duration::from_secs(60)),
        },
        "redis" | "valkey" => StorageBackendConfig::Redis {
            url: env
                .get("RATE_LIMIT_REDIS_URL")
                .ok_or(ConfigError::Missing("RATE_LIMIT_REDIS_URL"))?,
        },
        "dynamodb" => StorageBackendConfig::DynamoDb {
            table: env
                .get("RATE_LIMIT_DYNAMODB_TABLE")
                .ok_or(ConfigError::Missing("RATE_LIMIT_DYNAMODB_TABLE"))?,
            consistent_read: env
                .flag("RATE_LIMIT_DYNAMODB_CONSISTENT_READ")?
                .unwrap_or(false),
            window: env
                .secs("RATE_LIMIT_DYNAMODB_WINDOW_SECONDS")?
                .unwrap_or(Duration::from_secs(60)),
        },
        other => {
            return Err(ConfigError::invalid(
                "RATE_LIMIT_BACKEND",
                format!("expected memory, redis or dynamodb, got `{other}`"),
            ));
        }
    };

    let global_limits: Vec<LimitDefinition> = match env.get("RATE_LIMIT_GLOBAL_LIMITS") {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| ConfigError::invalid("RATE_LIMIT_GLOBAL_LIMITS", e))?,
        None => Vec::new(),
    };
    for limit in &global_limits {
        limit
            .validate()
            .map_err(|e| ConfigError::invalid("RATE_LIMIT_GLOBAL_LIMITS", e))?;
    }

    Ok(RateLimitConfig {
        enabled: env.flag("RATE_LIMIT_ENABLED")?.unwrap_or(true),
        backend,
        failure_mode: env
            .parse("RATE_LIMIT_FAILURE_MODE")?
            .unwrap_or(defaults.failure_mode),
        fail_closed_retry_after: env
            .secs("RATE_LIMIT_FAIL_CLOSED_RETRY_AFTER_SECONDS")?
            .unwrap_or(defaults.fail_closed_retry_after),
        storage_timeout: env
            .millis("RATE_LIMIT_STORAGE_TIMEOUT_MS")?
            .unwrap_or(defaults.storage_timeout),
        key_prefix: env.get("RATE_LIMIT_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        global_limits,
    })
}

fn breaker_config<F: Fn(&str) -> Option<String>>(
    env: &Env<F>,
) -> Result<CircuitBreakerConfig, ConfigError> {
    let defaults = CircuitBreakerConfig::default();
    let config = CircuitBreakerConfig {
        failure_threshold: env
            .parse("BREAKER_FAILURE_THRESHOLD")?
            .unwrap_or(defaults.failure_threshold),
        success_threshold: env
            .parse("BREAKER_SUCCESS_THRESHOLD")?
            .unwrap_or(defaults.success_threshold),
        timeout: env.millis("BREAKER_TIMEOUT_MS")?.unwrap_or(defaults.timeout),
        max_half_open_requests: env
            .parse("BREAKER_MAX_HALF_OPEN_REQUESTS")?
            .unwrap_or(defaults.max_half_open_requests),
    };

    if config.failure_threshold == 0 {
        return Err(ConfigError::invalid("BREAKER_FAILURE_THRESHOLD", "must be at least 1"));
    }
    if config.success_threshold == 0 {
        return Err(ConfigError::invalid("BREAKER_SUCCESS_THRESHOLD", "must be at least 1"));
    }
    if config.max_half_open_requests == 0 {
        return Err(ConfigError::invalid(
            "BREAKER_MAX_HALF_OPEN_REQUESTS",
            "must be at least 1",
        ));
    }
    Ok(config)
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| raw.trim().parse::<T>().map_err(|e| ConfigError::invalid(key, e)))
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::invalid(key, format!("not a boolean: `{other}`"))),
            })
            .transpose()
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const MINIMAL: [(&str, &str); 2] = [
        ("GATEWAY_ROUTES_FILE", "routes.json"),
        ("AUTH_JWT_SECRET", "s3cret"),
    ];

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load(&MINIMAL).unwrap();

        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.app_env, AppEnv::Development);
        assert_eq!(config.auth.algorithm, Algorithm::HS256);
        assert_eq!(config.auth.cookie_name, "session");
        assert_eq!(config.auth.revocation.failure_mode, FailureMode::FailOpen);
        assert!(matches!(config.auth.revocation.backend, RevocationBackend::Static(ref v) if v.is_empty()));
        assert!(matches!(config.rate_limit.backend, StorageBackendConfig::Memory { .. }));
        assert_eq!(config.rate_limit.failure_mode, FailureMode::FailOpen);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_missing_values_fail_startup() {
        assert!(matches!(
            load(&[("AUTH_JWT_SECRET", "x")]),
            Err(ConfigError::Missing("GATEWAY_ROUTES_FILE"))
        ));
        assert!(matches!(
            load(&[("GATEWAY_ROUTES_FILE", "r.json")]),
            Err(ConfigError::Missing("AUTH_JWT_SECRET"))
        ));

        let mut vars = MINIMAL.to_vec();
        vars.push(("RATE_LIMIT_BACKEND", "redis"));
        assert!(matches!(load(&vars), Err(ConfigError::Missing("RATE_LIMIT_REDIS_URL"))));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            ("PORT", "eighty"),
            ("AUTH_JWT_ALGORITHM", "HS1024"),
            ("AUTH_REQUIRED_CLAIMS", "user_id,shoe_size"),
            ("RATE_LIMIT_FAILURE_MODE", "sometimes"),
            ("RATE_LIMIT_BACKEND", "floppy"),
            ("RATE_LIMIT_GLOBAL_LIMITS", "[{\"name\": \"g\"}]"),
            ("BREAKER_FAILURE_THRESHOLD", "0"),
            ("AUTH_ALLOW_BEARER", "maybe"),
        ] {
            let mut vars = MINIMAL.to_vec();
            vars.push((key, value));
            assert!(
                matches!(load(&vars), Err(ConfigError::Invalid { .. })),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_full_config() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("PORT", "8081"),
            ("APP_ENV", "prod"),
            ("AUTH_CLOCK_SKEW_SECONDS", "5"),
            ("AUTH_REQUIRED_CLAIMS", "user_id, roles"),
            ("AUTH_REVOCATION_VALKEY_URL", "redis://cache:6379"),
            ("AUTH_REVOCATION_FAILURE_MODE", "fail-closed"),
            ("RATE_LIMIT_BACKEND", "dynamodb"),
            ("RATE_LIMIT_DYNAMODB_TABLE", "buckets"),
            ("RATE_LIMIT_DYNAMODB_CONSISTENT_READ", "true"),
            ("RATE_LIMIT_DYNAMODB_WINDOW_SECONDS", "300"),
            ("RATE_LIMIT_FAILURE_MODE", "fail-closed"),
            (
                "RATE_LIMIT_GLOBAL_LIMITS",
                r#"[{"name": "per-ip", "key": "ip", "limit": 1000, "window_secs": 60, "scope": "global"}]"#,
            ),
            ("BREAKER_TIMEOUT_MS", "100"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.addr.port(), 8081);
        assert!(config.app_env.is_production());
        assert_eq!(config.auth.clock_skew, Duration::from_secs(5));
        assert_eq!(
            config.auth.required_claims,
            vec![RequiredClaim::UserId, RequiredClaim::Roles]
        );
        assert!(matches!(
            config.auth.revocation.backend,
            RevocationBackend::Valkey { ref prefix, .. } if prefix == "session:revoked"
        ));
        assert_eq!(config.auth.revocation.failure_mode, FailureMode::FailClosed);
        assert!(matches!(
            config.rate_limit.backend,
            StorageBackendConfig::DynamoDb { consistent_read: true, window, .. }
                if window == Duration::from_secs(300)
        ));
        assert_eq!(config.rate_limit.global_limits.len(), 1);
        assert_eq!(config.breaker.timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_pem_newlines_are_restored() {
        let vars = [
            ("GATEWAY_ROUTES_FILE", "routes.json"),
            ("AUTH_JWT_ALGORITHM", "EdDSA"),
            ("AUTH_JWT_PUBLIC_KEY_PEM", "-----BEGIN PUBLIC KEY-----\\nabc\\n-----END PUBLIC KEY-----"),
        ];
        let config = load(&vars).unwrap();

        match config.auth.key {
            KeyMaterial::PublicKeyPem(pem) => assert_eq!(pem.lines().count(), 3),
            other => panic!("unexpected key {other:?}"),
        }
    }

    #[test]
    fn test_secret_is_not_printed() {
        let key = KeyMaterial::Secret("hunter2".into());
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
