use std::{env, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration as StdDuration};

use chrono::Duration;
use hc_common::{Money, Secret};
use homechef_engine::{
    db_types::NewCancellationPolicy,
    hce_api::webhook_objects::WebhookDefaults,
    lifecycle::FlowSettings,
    webhooks::SecretVault,
};
use log::*;
use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::errors::ServerError;

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DB_URL: &str = "sqlite://data/homechef.db";
const DEFAULT_FREE_CANCEL_WINDOW: i64 = 30;
const MAX_FREE_CANCEL_WINDOW: i64 = 300;
const DEFAULT_PENALTY_RATE: f64 = 0.4;
const DEFAULT_MIN_PENALTY: i64 = 20;
const DEFAULT_MAX_PENALTY: i64 = 500;
const DEFAULT_WEBHOOK_TIMEOUT: u64 = 10;
const DEFAULT_WEBHOOK_WORKERS: usize = 4;
const DEFAULT_SWEEP_INTERVAL: u64 = 30;
const DEFAULT_CHEF_RESPONSE_WINDOW: i64 = 300;
const DEFAULT_TIP_WINDOW_HOURS: i64 = 72;
const DEFAULT_REQUEST_TIMEOUT: u64 = 15;
const DEFAULT_DB_TIMEOUT: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE: u64 = 30;

/// Every environment variable the server reads. Secret-bearing variables are flagged so that their values are never
/// printed.
pub const ENV_VARS: [(&str, bool); 24] = [
    ("HTTP_ADDR", false),
    ("DB_URL", false),
    ("TLS_CERT", false),
    ("TLS_KEY", false),
    ("FREE_CANCEL_WINDOW_SEC", false),
    ("PENALTY_RATE", false),
    ("MIN_PENALTY", false),
    ("MAX_PENALTY", false),
    ("WEBHOOK_MAX_RETRIES", false),
    ("WEBHOOK_BASE_DELAY_SEC", false),
    ("WEBHOOK_TIMEOUT_SEC", false),
    ("WEBHOOK_WORKERS", false),
    ("WEBHOOK_SWEEP_INTERVAL_SEC", false),
    ("WEBHOOK_ENCRYPTION_KEY", true),
    ("AUTH_JWT_SECRET", true),
    ("PAYMENT_CALLBACK_SECRET", true),
    ("CHEF_RESPONSE_WINDOW_SEC", false),
    ("TIP_WINDOW_HOURS", false),
    ("REQUEST_TIMEOUT_SEC", false),
    ("DB_TIMEOUT_SEC", false),
    ("SHUTDOWN_GRACE_SEC", false),
    ("RUST_LOG", false),
    ("DISPATCH_QUEUE_SIZE", false),
    ("WS_BUFFER_SIZE", false),
];

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    pub database_url: String,
    pub tls: Option<TlsConfig>,
    /// Seeds the cancellation policy when the store has none. An existing active policy always wins.
    pub seed_policy: NewCancellationPolicy,
    pub webhooks: WebhookConfig,
    pub auth: AuthConfig,
    /// Shared secret of the payment collaborator. When unset, callbacks are accepted without a signature check.
    pub payment_callback_secret: Option<Secret<String>>,
    pub flow: FlowSettings,
    pub request_timeout: StdDuration,
    pub db_timeout: StdDuration,
    pub shutdown_grace: StdDuration,
    /// Capacity of the in-memory dispatch queue and of each WebSocket send buffer.
    pub dispatch_queue_size: usize,
    pub ws_buffer_size: usize,
}

#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub defaults: WebhookDefaults,
    pub timeout: StdDuration,
    pub workers: usize,
    pub sweep_interval: StdDuration,
    pub encryption_key: Secret<String>,
}

impl WebhookConfig {
    pub fn vault(&self) -> Result<SecretVault, ServerError> {
        SecretVault::from_hex(self.encryption_key.reveal())
            .map_err(|e| ServerError::ConfigurationError(format!("WEBHOOK_ENCRYPTION_KEY: {e}")))
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: Secret<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_url: DEFAULT_DB_URL.to_string(),
            tls: None,
            seed_policy: default_seed_policy(),
            webhooks: WebhookConfig {
                defaults: WebhookDefaults::default(),
                timeout: StdDuration::from_secs(DEFAULT_WEBHOOK_TIMEOUT),
                workers: DEFAULT_WEBHOOK_WORKERS,
                sweep_interval: StdDuration::from_secs(DEFAULT_SWEEP_INTERVAL),
                encryption_key: random_encryption_key(),
            },
            auth: AuthConfig { jwt_secret: random_jwt_secret() },
            payment_callback_secret: None,
            flow: FlowSettings::default(),
            request_timeout: StdDuration::from_secs(DEFAULT_REQUEST_TIMEOUT),
            db_timeout: StdDuration::from_secs(DEFAULT_DB_TIMEOUT),
            shutdown_grace: StdDuration::from_secs(DEFAULT_SHUTDOWN_GRACE),
            dispatch_queue_size: 1024,
            ws_buffer_size: 256,
        }
    }
}

fn default_seed_policy() -> NewCancellationPolicy {
    NewCancellationPolicy {
        free_window_seconds: DEFAULT_FREE_CANCEL_WINDOW,
        penalty_rate: DEFAULT_PENALTY_RATE,
        min_penalty: Money::from_major(DEFAULT_MIN_PENALTY),
        max_penalty: Money::from_major(DEFAULT_MAX_PENALTY),
        description: describe_policy(DEFAULT_FREE_CANCEL_WINDOW, DEFAULT_PENALTY_RATE),
    }
}

fn describe_policy(window: i64, rate: f64) -> String {
    format!("{window}s free cancellation window, {:.0}% penalty afterwards", rate * 100.0)
}

impl ServerConfig {
    /// Reads the configuration from the environment. Any value that is present but invalid is an error; missing values
    /// fall back to their defaults.
    pub fn from_env() -> Result<Self, ServerError> {
        let http_addr = parse_var("HTTP_ADDR", DEFAULT_HTTP_ADDR.parse().map_err(config_err)?)?;
        let database_url = env::var("DB_URL").ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| {
            info!("🪛️ DB_URL is not set. Using {DEFAULT_DB_URL}");
            DEFAULT_DB_URL.to_string()
        });
        let tls = match (non_empty_var("TLS_CERT"), non_empty_var("TLS_KEY")) {
            (Some(cert), Some(key)) => {
                Some(TlsConfig { cert_path: PathBuf::from(cert), key_path: PathBuf::from(key) })
            },
            (None, None) => None,
            _ => {
                return Err(ServerError::ConfigurationError(
                    "TLS_CERT and TLS_KEY must either both be set or both be unset.".to_string(),
                ))
            },
        };
        let seed_policy = seed_policy_from_env()?;
        let webhooks = webhook_config_from_env()?;
        let auth = match non_empty_var("AUTH_JWT_SECRET") {
            Some(s) => AuthConfig { jwt_secret: Secret::new(s) },
            None => AuthConfig { jwt_secret: random_jwt_secret() },
        };
        let payment_callback_secret = non_empty_var("PAYMENT_CALLBACK_SECRET").map(Secret::new);
        if payment_callback_secret.is_none() {
            warn!(
                "🚨️ PAYMENT_CALLBACK_SECRET is not set. Payment callbacks will be accepted WITHOUT a signature check. \
                 Do not run production like this."
            );
        }
        let chef_window = parse_var("CHEF_RESPONSE_WINDOW_SEC", DEFAULT_CHEF_RESPONSE_WINDOW)?;
        check_range("CHEF_RESPONSE_WINDOW_SEC", chef_window, 1, 86_400)?;
        let tip_hours = parse_var("TIP_WINDOW_HOURS", DEFAULT_TIP_WINDOW_HOURS)?;
        check_range("TIP_WINDOW_HOURS", tip_hours, 0, 24 * 365)?;
        let flow = FlowSettings {
            chef_response_window: Duration::seconds(chef_window),
            tip_window: Duration::hours(tip_hours),
        };
        let request_timeout = positive_secs("REQUEST_TIMEOUT_SEC", DEFAULT_REQUEST_TIMEOUT)?;
        let db_timeout = positive_secs("DB_TIMEOUT_SEC", DEFAULT_DB_TIMEOUT)?;
        let shutdown_grace = positive_secs("SHUTDOWN_GRACE_SEC", DEFAULT_SHUTDOWN_GRACE)?;
        let dispatch_queue_size = parse_var("DISPATCH_QUEUE_SIZE", 1024usize)?.max(1);
        let ws_buffer_size = parse_var("WS_BUFFER_SIZE", 256usize)?.max(1);
        Ok(Self {
            http_addr,
            database_url,
            tls,
            seed_policy,
            webhooks,
            auth,
            payment_callback_secret,
            flow,
            request_timeout,
            db_timeout,
            shutdown_grace,
            dispatch_queue_size,
            ws_buffer_size,
        })
    }
}

fn seed_policy_from_env() -> Result<NewCancellationPolicy, ServerError> {
    let free_window_seconds = parse_var("FREE_CANCEL_WINDOW_SEC", DEFAULT_FREE_CANCEL_WINDOW)?;
    check_range("FREE_CANCEL_WINDOW_SEC", free_window_seconds, 0, MAX_FREE_CANCEL_WINDOW)?;
    let penalty_rate = parse_var("PENALTY_RATE", DEFAULT_PENALTY_RATE)?;
    if !(0.0..=1.0).contains(&penalty_rate) {
        return Err(ServerError::ConfigurationError(format!("PENALTY_RATE must be between 0 and 1, got {penalty_rate}")));
    }
    let min_penalty = parse_var("MIN_PENALTY", Money::from_major(DEFAULT_MIN_PENALTY))?;
    let max_penalty = parse_var("MAX_PENALTY", Money::from_major(DEFAULT_MAX_PENALTY))?;
    if min_penalty > max_penalty {
        return Err(ServerError::ConfigurationError(format!(
            "MIN_PENALTY ({min_penalty}) must not exceed MAX_PENALTY ({max_penalty})"
        )));
    }
    Ok(NewCancellationPolicy {
        free_window_seconds,
        penalty_rate,
        min_penalty,
        max_penalty,
        description: describe_policy(free_window_seconds, penalty_rate),
    })
}

fn webhook_config_from_env() -> Result<WebhookConfig, ServerError> {
    let max_attempts = parse_var("WEBHOOK_MAX_RETRIES", WebhookDefaults::default().max_attempts)?;
    check_range("WEBHOOK_MAX_RETRIES", max_attempts, 1, 20)?;
    let base_delay_seconds = parse_var("WEBHOOK_BASE_DELAY_SEC", WebhookDefaults::default().base_delay_seconds)?;
    check_range("WEBHOOK_BASE_DELAY_SEC", base_delay_seconds, 1, 3600)?;
    let timeout = positive_secs("WEBHOOK_TIMEOUT_SEC", DEFAULT_WEBHOOK_TIMEOUT)?;
    let workers = parse_var("WEBHOOK_WORKERS", DEFAULT_WEBHOOK_WORKERS)?;
    if workers == 0 {
        return Err(ServerError::ConfigurationError("WEBHOOK_WORKERS must be at least 1".to_string()));
    }
    let sweep_interval = positive_secs("WEBHOOK_SWEEP_INTERVAL_SEC", DEFAULT_SWEEP_INTERVAL)?;
    let encryption_key = match non_empty_var("WEBHOOK_ENCRYPTION_KEY") {
        Some(key) => {
            let key = Secret::new(key);
            SecretVault::from_hex(key.reveal())
                .map_err(|e| ServerError::ConfigurationError(format!("WEBHOOK_ENCRYPTION_KEY: {e}")))?;
            key
        },
        None => random_encryption_key(),
    };
    Ok(WebhookConfig {
        defaults: WebhookDefaults { max_attempts, base_delay_seconds },
        timeout,
        workers,
        sweep_interval,
        encryption_key,
    })
}

fn random_encryption_key() -> Secret<String> {
    warn!(
        "🚨️🚨️🚨️ WEBHOOK_ENCRYPTION_KEY has not been set. I'm using a random key for this session. Webhook secrets \
         stored now will be unreadable after a restart. DO NOT operate on production like this. 🚨️🚨️🚨️"
    );
    let key: [u8; 32] = thread_rng().gen();
    Secret::new(hex::encode(key))
}

fn random_jwt_secret() -> Secret<String> {
    warn!(
        "🚨️🚨️🚨️ AUTH_JWT_SECRET has not been set. I'm using a random value for this session, so no externally issued \
         token will be accepted. DO NOT operate on production like this. 🚨️🚨️🚨️"
    );
    let secret = thread_rng().sample_iter(&Alphanumeric).take(48).map(char::from).collect::<String>();
    Secret::new(secret)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn config_err<E: Display>(e: E) -> ServerError {
    ServerError::ConfigurationError(e.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ServerError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match non_empty_var(name) {
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|e| ServerError::ConfigurationError(format!("{name} has an invalid value ({s}). {e}"))),
        None => {
            debug!("🪛️ {name} is not set. Using the default value of {default}.");
            Ok(default)
        },
    }
}

fn positive_secs(name: &str, default: u64) -> Result<StdDuration, ServerError> {
    let secs = parse_var(name, default)?;
    if secs == 0 {
        return Err(ServerError::ConfigurationError(format!("{name} must be at least 1 second")));
    }
    Ok(StdDuration::from_secs(secs))
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), ServerError> {
    if value < min || value > max {
        return Err(ServerError::ConfigurationError(format!("{name} must be between {min} and {max}, got {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    // The environment is process-wide, so tests that touch it take turns
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for (name, _) in ENV_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.http_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.database_url, DEFAULT_DB_URL);
        assert!(config.tls.is_none());
        assert_eq!(config.seed_policy.free_window_seconds, 30);
        assert_eq!(config.seed_policy.min_penalty, Money::from_major(20));
        assert_eq!(config.webhooks.defaults.max_attempts, 5);
        assert_eq!(config.webhooks.defaults.base_delay_seconds, 30);
        assert_eq!(config.webhooks.timeout, StdDuration::from_secs(10));
        assert_eq!(config.flow.tip_window, Duration::hours(72));
        assert!(config.payment_callback_secret.is_none());
        assert!(config.webhooks.vault().is_ok());
    }

    #[test]
    fn invalid_values_are_errors() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("FREE_CANCEL_WINDOW_SEC", "301");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::ConfigurationError(_))));
        clear_env();
        env::set_var("PENALTY_RATE", "1.5");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::ConfigurationError(_))));
        clear_env();
        env::set_var("WEBHOOK_ENCRYPTION_KEY", "not-hex");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::ConfigurationError(_))));
        clear_env();
        env::set_var("TLS_CERT", "/etc/homechef/cert.pem");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::ConfigurationError(_))));
        clear_env();
        env::set_var("HTTP_ADDR", "localhost");
        assert!(matches!(ServerConfig::from_env(), Err(ServerError::ConfigurationError(_))));
        clear_env();
    }

    #[test]
    fn overrides_are_read() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("HTTP_ADDR", "0.0.0.0:9000");
        env::set_var("FREE_CANCEL_WINDOW_SEC", "0");
        env::set_var("PENALTY_RATE", "0.25");
        env::set_var("WEBHOOK_MAX_RETRIES", "3");
        env::set_var("PAYMENT_CALLBACK_SECRET", "pcs_123");
        env::set_var("WEBHOOK_ENCRYPTION_KEY", "11".repeat(32));
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.seed_policy.free_window_seconds, 0);
        assert_eq!(config.seed_policy.penalty_rate, 0.25);
        assert_eq!(config.webhooks.defaults.max_attempts, 3);
        assert_eq!(config.payment_callback_secret.as_ref().map(|s| s.reveal().as_str()), Some("pcs_123"));
        assert_eq!(format!("{:?}", config.auth.jwt_secret), "****");
        clear_env();
    }
}
