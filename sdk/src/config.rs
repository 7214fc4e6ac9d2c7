//! Process-wide configuration.
//!
//! Loaded from the environment once at startup and shared behind a
//! [`OnceLock`]. Tests construct [`KernelConfig`] values directly (or call
//! [`KernelConfig::load`] for a fresh read) instead of mutating the global.

use {
    std::{
        env,
        net::SocketAddr,
        path::PathBuf,
        sync::OnceLock,
        time::Duration,
    },
    thiserror::Error,
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_KMS_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_IDEMPOTENCY_BODY_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_STREAM_BATCH_SIZE: i64 = 25;
pub const DEFAULT_STREAM_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuntimeEnv {
    #[default]
    Development,
    Production,
}

impl RuntimeEnv {
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Signer selection and KMS transport settings.
#[derive(Clone, Debug)]
pub struct SigningConfig {
    /// `SIGNING_PROXY_URL`, with `KERNEL_KMS_ENDPOINT` as the legacy alias.
    pub proxy_url: Option<String>,
    /// `SIGNING_PROXY_API_KEY` bearer token.
    pub api_key: Option<String>,
    /// `REQUIRE_SIGNING_PROXY` fail-closed guard.
    pub require_proxy: bool,
    /// `KERNEL_KMS_KEY_ID` forwarded as the proxy `key_id`.
    pub key_id: Option<String>,
    /// `KMS_TIMEOUT_MS` request timeout.
    pub timeout_ms: u64,
    /// `KERNEL_CLIENT_CERT` / `KERNEL_CLIENT_KEY` / `KERNEL_CA_CERT` (mTLS).
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    /// `KERNEL_SIGNER_KEY_B64` local Ed25519 seed.
    pub local_key_b64: Option<String>,
    /// `REPOWRITER_SIGNING_SECRET` dev HMAC key; must be unset in production.
    pub dev_secret: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            api_key: None,
            require_proxy: false,
            key_id: None,
            timeout_ms: DEFAULT_KMS_TIMEOUT_MS,
            client_cert: None,
            client_key: None,
            ca_cert: None,
            local_key_b64: None,
            dev_secret: None,
        }
    }
}

/// Quorum membership for upgrade approvals.
#[derive(Clone, Debug)]
pub struct UpgradeConfig {
    pub approver_ids: Vec<String>,
    pub required_approvals: u32,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            approver_ids: Vec::new(),
            required_approvals: 1,
        }
    }
}

/// External archive the streaming worker publishes audit events to.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub env: RuntimeEnv,
    pub port: u16,
    /// `BIND_ADDR` wins over `PORT` when both are set.
    pub bind_addr: Option<SocketAddr>,
    pub database_url: Option<String>,
    pub signing: SigningConfig,
    pub upgrade: UpgradeConfig,
    /// `KERNEL_SIGNER_REGISTRY`: signer/approver key registry file.
    pub registry_path: Option<PathBuf>,
    pub idempotency_body_limit: usize,
    pub idempotency_ttl: Duration,
    pub archive: Option<ArchiveConfig>,
    pub stream_batch_size: i64,
    pub stream_interval: Duration,
    pub reason_graph_url: Option<String>,
    /// `KERNEL_DEV_AUTH`: allow the dev principal header in production.
    pub dev_auth: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            env: RuntimeEnv::Development,
            port: DEFAULT_PORT,
            bind_addr: None,
            database_url: None,
            signing: SigningConfig::default(),
            upgrade: UpgradeConfig::default(),
            registry_path: None,
            idempotency_body_limit: DEFAULT_IDEMPOTENCY_BODY_LIMIT,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            archive: None,
            stream_batch_size: DEFAULT_STREAM_BATCH_SIZE,
            stream_interval: DEFAULT_STREAM_INTERVAL,
            reason_graph_url: None,
            dev_auth: false,
        }
    }
}

static GLOBAL: OnceLock<KernelConfig> = OnceLock::new();

impl KernelConfig {
    /// Read configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = match var("KERNEL_ENV").as_deref() {
            Some("production") => RuntimeEnv::Production,
            _ => RuntimeEnv::Development,
        };

        let signing = SigningConfig {
            proxy_url: var("SIGNING_PROXY_URL").or_else(|| var("KERNEL_KMS_ENDPOINT")),
            api_key: var("SIGNING_PROXY_API_KEY"),
            require_proxy: flag("REQUIRE_SIGNING_PROXY"),
            key_id: var("KERNEL_KMS_KEY_ID"),
            timeout_ms: parsed("KMS_TIMEOUT_MS")?.unwrap_or(DEFAULT_KMS_TIMEOUT_MS),
            client_cert: var("KERNEL_CLIENT_CERT").map(PathBuf::from),
            client_key: var("KERNEL_CLIENT_KEY").map(PathBuf::from),
            ca_cert: var("KERNEL_CA_CERT").map(PathBuf::from),
            local_key_b64: var("KERNEL_SIGNER_KEY_B64"),
            dev_secret: var("REPOWRITER_SIGNING_SECRET"),
        };

        let upgrade = UpgradeConfig {
            approver_ids: var("UPGRADE_APPROVER_IDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            required_approvals: parsed("UPGRADE_REQUIRED_APPROVALS")?.unwrap_or(1),
        };

        let archive = var("ARCHIVE_URL").map(|url| ArchiveConfig {
            url,
            api_key: var("ARCHIVE_API_KEY"),
        });

        let bind_addr = match var("BIND_ADDR") {
            Some(raw) => Some(raw.parse().map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                message: format!("{e}"),
            })?),
            None => None,
        };

        Ok(Self {
            env,
            port: parsed("PORT")?.unwrap_or(DEFAULT_PORT),
            bind_addr,
            database_url: var("DATABASE_URL"),
            signing,
            upgrade,
            registry_path: var("KERNEL_SIGNER_REGISTRY").map(PathBuf::from),
            idempotency_body_limit: parsed("IDEMPOTENCY_RESPONSE_BODY_LIMIT")?
                .unwrap_or(DEFAULT_IDEMPOTENCY_BODY_LIMIT),
            idempotency_ttl: parsed("IDEMPOTENCY_TTL_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDEMPOTENCY_TTL),
            archive,
            stream_batch_size: parsed("STREAM_BATCH_SIZE")?.unwrap_or(DEFAULT_STREAM_BATCH_SIZE),
            stream_interval: parsed("STREAM_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STREAM_INTERVAL),
            reason_graph_url: var("REASON_GRAPH_URL"),
            dev_auth: flag("KERNEL_DEV_AUTH"),
        })
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.bind_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }

    /// Install the process-wide configuration. First caller wins.
    pub fn init(config: KernelConfig) -> &'static KernelConfig {
        GLOBAL.get_or_init(|| config)
    }

    /// The installed process-wide configuration, if any.
    pub fn global() -> Option<&'static KernelConfig> {
        GLOBAL.get()
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn flag(name: &str) -> bool {
    matches!(
        var(name).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                message: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use {super::*, serial_test::serial};

    fn clear_kernel_env() {
        for name in [
            "KERNEL_ENV",
            "PORT",
            "BIND_ADDR",
            "DATABASE_URL",
            "SIGNING_PROXY_URL",
            "SIGNING_PROXY_API_KEY",
            "REQUIRE_SIGNING_PROXY",
            "KERNEL_KMS_ENDPOINT",
            "KERNEL_KMS_KEY_ID",
            "KMS_TIMEOUT_MS",
            "KERNEL_SIGNER_KEY_B64",
            "REPOWRITER_SIGNING_SECRET",
            "UPGRADE_APPROVER_IDS",
            "UPGRADE_REQUIRED_APPROVALS",
            "IDEMPOTENCY_RESPONSE_BODY_LIMIT",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        clear_kernel_env();
        let cfg = KernelConfig::load().unwrap();
        assert_eq!(cfg.env, RuntimeEnv::Development);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.signing.timeout_ms, DEFAULT_KMS_TIMEOUT_MS);
        assert_eq!(cfg.idempotency_body_limit, DEFAULT_IDEMPOTENCY_BODY_LIMIT);
        assert_eq!(cfg.upgrade.required_approvals, 1);
        assert!(cfg.upgrade.approver_ids.is_empty());
    }

    #[test]
    #[serial]
    fn kms_endpoint_is_a_proxy_alias() {
        clear_kernel_env();
        std::env::set_var("KERNEL_KMS_ENDPOINT", "https://kms.internal");
        let cfg = KernelConfig::load().unwrap();
        assert_eq!(cfg.signing.proxy_url.as_deref(), Some("https://kms.internal"));

        std::env::set_var("SIGNING_PROXY_URL", "https://proxy.internal");
        let cfg = KernelConfig::load().unwrap();
        assert_eq!(
            cfg.signing.proxy_url.as_deref(),
            Some("https://proxy.internal")
        );
        clear_kernel_env();
    }

    #[test]
    #[serial]
    fn approver_list_parses_and_trims() {
        clear_kernel_env();
        std::env::set_var("UPGRADE_APPROVER_IDS", "alice, bob ,,carol");
        std::env::set_var("UPGRADE_REQUIRED_APPROVALS", "2");
        let cfg = KernelConfig::load().unwrap();
        assert_eq!(cfg.upgrade.approver_ids, vec!["alice", "bob", "carol"]);
        assert_eq!(cfg.upgrade.required_approvals, 2);
        clear_kernel_env();
    }

    #[test]
    #[serial]
    fn invalid_numbers_are_rejected() {
        clear_kernel_env();
        std::env::set_var("UPGRADE_REQUIRED_APPROVALS", "three");
        assert!(matches!(
            KernelConfig::load(),
            Err(ConfigError::Invalid {
                name: "UPGRADE_REQUIRED_APPROVALS",
                ..
            })
        ));
        clear_kernel_env();
    }
}
