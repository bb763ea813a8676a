use config::Config;
use config::ConfigError;
use config::Environment as ConfigEnvironment;
use config::File;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::PgConnectOptions;
use sqlx::postgres::PgSslMode;

/// Top-level configuration. Loaded from
/// `configuration/base.yaml`, layered with `configuration/{environment}.yaml`,
/// and finally overridden by `APP__`-prefixed environment variables (double
/// underscore separates nested keys, e.g. `APP__DATABASE__PORT`).
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub monitored_mailbox: String,
    pub ap_address: String,
    pub mail_client: MailClientSettings,
    pub extractor: ExtractorSettings,
    pub notification_sink: NotificationSinkSettings,
    pub blob_store: BlobStoreSettings,
    pub retry: RetrySettings,
    pub breakers: BreakerSettings,
    pub dedup: DedupSettings,
    pub queues: QueueSettings,
    pub rate_limit: RateLimitSettings,
    pub poller: PollerSettings,
    pub subscription: SubscriptionSettings,
    pub enricher: EnricherSettings,
    pub poster: PosterSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String { "info".to_string() }

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub base_url: String,
    pub webhook_path: String,
    pub webhook_public_url: String,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    /// Options for connecting without selecting a database, used to create
    /// per-test databases.
    pub fn connection_without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }

    pub fn connection(&self) -> PgConnectOptions {
        self.connection_without_db().database(&self.database_name)
    }
}

#[derive(Deserialize, Clone)]
pub struct MailClientSettings {
    pub base_url: String,
    pub sender: String,
    pub auth_token: Secret<String>,
    #[serde(default = "default_mail_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_mail_timeout_ms() -> u64 { 15_000 }

#[derive(Deserialize, Clone)]
pub struct ExtractorSettings {
    pub base_url: String,
    pub auth_token: Secret<String>,
    pub enabled: bool,
    #[serde(default = "default_extractor_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_pdf_bytes")]
    pub max_pdf_bytes: u64,
    #[serde(default)]
    pub force_llm_on_empty_text: bool,
}

fn default_extractor_timeout_ms() -> u64 { 15_000 }
fn default_max_pdf_bytes() -> u64 { 10 * 1024 * 1024 }

#[derive(Deserialize, Clone)]
pub struct NotificationSinkSettings {
    pub webhook_url: String,
    #[serde(default = "default_chat_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_chat_timeout_ms() -> u64 { 10_000 }

/// Thin Postgres-backed BlobStore; `SignedURL`
/// is an HMAC-signed token appended to `application.base_url`, since there is
/// no real object-storage CDN in this deployment.
#[derive(Deserialize, Clone)]
pub struct BlobStoreSettings {
    pub signing_key: Secret<String>,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
}

fn default_signed_url_ttl_secs() -> u64 { 3600 }

#[derive(Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }

#[derive(Deserialize, Clone, Copy)]
pub struct BreakerTuning {
    pub fail_max: u32,
    pub reset_seconds: u64,
}

#[derive(Deserialize, Clone)]
pub struct BreakerSettings {
    #[serde(default = "default_mail_breaker")]
    pub mail: BreakerTuning,
    #[serde(default = "default_extractor_breaker")]
    pub extractor: BreakerTuning,
    #[serde(default = "default_kv_store_breaker")]
    pub kv_store: BreakerTuning,
}

fn default_mail_breaker() -> BreakerTuning {
    BreakerTuning { fail_max: 5, reset_seconds: 60 }
}
fn default_extractor_breaker() -> BreakerTuning {
    BreakerTuning { fail_max: 3, reset_seconds: 30 }
}
fn default_kv_store_breaker() -> BreakerTuning {
    BreakerTuning { fail_max: 10, reset_seconds: 30 }
}

#[derive(Deserialize, Clone)]
pub struct DedupSettings {
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_window_minutes: i64,
}

fn default_stale_claim_minutes() -> i64 { 30 }

#[derive(Deserialize, Clone)]
pub struct QueueSettings {
    #[serde(default = "default_max_dequeue")]
    pub max_dequeue: i32,
    #[serde(default = "default_visibility_minutes")]
    pub visibility_timeout_minutes: i64,
}

fn default_max_dequeue() -> i32 { 5 }
fn default_visibility_minutes() -> i64 { 10 }

#[derive(Deserialize, Clone)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_requests_per_minute() -> u32 { 100 }

#[derive(Deserialize, Clone)]
pub struct PollerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poller_interval")]
    pub interval_minutes: u64,
}

fn default_true() -> bool { true }
fn default_poller_interval() -> u64 { 60 }

#[derive(Deserialize, Clone)]
pub struct SubscriptionSettings {
    #[serde(default = "default_subscription_ttl_days")]
    pub ttl_days: i64,
}

fn default_subscription_ttl_days() -> i64 { 6 }

/// How the Enricher derives a lookup key when a `RawMail` carries no
/// `VendorHint`.
#[derive(Deserialize, Clone)]
pub struct EnricherSettings {
    #[serde(default = "default_lookup_strategy")]
    pub lookup_strategy: String,
}

fn default_lookup_strategy() -> String { "domain_without_tld".to_string() }

/// Controls the Poster's inline-attachment-vs-signed-url fallback.
#[derive(Deserialize, Clone)]
pub struct PosterSettings {
    #[serde(default = "default_inline_attachment_max_bytes")]
    pub inline_attachment_max_bytes: u64,
}

fn default_inline_attachment_max_bytes() -> u64 { 10 * 1024 * 1024 }

/// Provider-enforced ceiling on subscription lifetime.
pub const PROVIDER_MAX_SUBSCRIPTION_DAYS: i64 = 7;

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment; use `local` or `production`"
            )),
        }
    }
}

/// Load configuration from `configuration/base.yaml`, layered with
/// `configuration/{APP_ENVIRONMENT}.yaml` (default `local`), then overridden
/// by `APP__`-prefixed environment variables.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir().expect("failed to determine current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let environment_filename = format!("{}.yaml", environment.as_str());

    let settings = Config::builder()
        .add_source(File::from(configuration_directory.join("base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)))
        .add_source(
            ConfigEnvironment::with_prefix("app")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize()
}
