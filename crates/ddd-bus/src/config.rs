//! Bus configuration from code or environment variables.

use std::env;
use std::time::Duration;

/// Environment variable holding the broker URL.
pub const BROKER_URL_ENV: &str = "DDD_RMQ_MESSAGEBUS_URL";

/// Configuration for one [`crate::DomainMessageBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Domain this service owns.
    pub domain: String,

    /// Broker URL without a virtual host path, e.g. `amqp://localhost:5672`.
    /// Each endpoint connects to the virtual host named after the domain it
    /// talks to, authenticated as [`BusConfig::domain`].
    pub broker_url: String,

    /// Password for the domain's broker user.
    pub password: Option<String>,

    /// Durable work queues that outlive the service, instead of auto-delete
    /// queues that vanish with their last consumer.
    pub permanent_consume: bool,

    /// Concurrent deliveries per consumer; 0 is unlimited.
    pub prefetch_count: u16,

    /// Timeout applied when a caller passes none. `None` waits forever.
    pub default_timeout: Option<Duration>,

    /// How often orphaned pending requests are swept.
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            broker_url: "amqp://localhost:5672".to_string(),
            password: None,
            permanent_consume: true,
            prefetch_count: 0,
            default_timeout: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// - `DDD_DOMAIN`: Owned domain (default: empty)
    /// - `DDD_RMQ_MESSAGEBUS_URL`: Broker URL (default: amqp://localhost:5672)
    /// - `DDD_RMQ_PASSWORD`: Broker password (default: none)
    /// - `DDD_PERMANENT_CONSUME`: Durable work queues (default: true)
    /// - `DDD_PREFETCH_COUNT`: Concurrent deliveries per consumer (default: 0)
    /// - `DDD_COMMAND_TIMEOUT_MS`: Default command timeout (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            domain: env::var("DDD_DOMAIN").unwrap_or_default(),

            broker_url: env::var(BROKER_URL_ENV)
                .ok()
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.broker_url),

            password: env::var("DDD_RMQ_PASSWORD").ok(),

            permanent_consume: env::var("DDD_PERMANENT_CONSUME")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.permanent_consume),

            prefetch_count: env::var("DDD_PREFETCH_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.prefetch_count),

            default_timeout: env::var("DDD_COMMAND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),

            sweep_interval: defaults.sweep_interval,
        }
    }

    /// Configuration for `domain`, everything else from the environment.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::from_env()
        }
    }

    #[must_use]
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    #[must_use]
    pub fn with_permanent_consume(mut self, permanent: bool) -> Self {
        self.permanent_consume = permanent;
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
