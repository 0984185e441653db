//! Event bus configuration management.

use crate::error::EventError;
use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SOURCE: &str = "skillhub";
const DEFAULT_AMQP_URL: &str = "amqp://127.0.0.1:5672/%2f";
const DEFAULT_EXCHANGE: &str = "skillhub.events";
const DEFAULT_PREFETCH: u16 = 16;
const DEFAULT_CLIENT_ID: &str = "skillhub-events";
const DEFAULT_CONSUMER_GROUP: &str = "skillhub";
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Which channel writes must succeed for a publish to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityPolicy {
    /// Only the reliable channel write is required; the stream write is a
    /// best-effort mirror.
    #[default]
    RequireReliable,
    /// Both channel writes are required.
    RequireBoth,
}

impl FromStr for DurabilityPolicy {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "require-reliable" => Ok(Self::RequireReliable),
            "require-both" => Ok(Self::RequireBoth),
            _ => Err(EventError::ConfigInvalid {
                var: "EVENT_BUS_DURABILITY".to_string(),
                reason: format!("Unknown durability policy: {s}"),
            }),
        }
    }
}

impl DurabilityPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequireReliable => "require-reliable",
            Self::RequireBoth => "require-both",
        }
    }
}

/// Security protocol for the log broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// Plaintext connection (no encryption or auth).
    Plaintext,
    /// SSL encryption without SASL auth.
    Ssl,
    /// SASL authentication without encryption.
    SaslPlaintext,
    /// SASL authentication with SSL encryption.
    SaslSsl,
}

impl FromStr for SecurityProtocol {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(EventError::ConfigInvalid {
                var: "KAFKA_SECURITY_PROTOCOL".to_string(),
                reason: format!("Unknown protocol: {s}"),
            }),
        }
    }
}

impl SecurityProtocol {
    /// Convert to the librdkafka string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    fn requires_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// SASL mechanism for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl FromStr for SaslMechanism {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM_SHA_256" => Ok(Self::ScramSha256),
            "SCRAM_SHA_512" => Ok(Self::ScramSha512),
            _ => Err(EventError::ConfigInvalid {
                var: "KAFKA_SASL_MECHANISM".to_string(),
                reason: format!("Unknown mechanism: {s}"),
            }),
        }
    }
}

impl SaslMechanism {
    /// Convert to the librdkafka string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials for authentication.
#[derive(Debug, Clone)]
pub struct SaslCredentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

/// Queue broker (reliable channel) settings.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Broker URL.
    pub url: String,
    /// Name of the single durable topic exchange.
    pub exchange: String,
    /// Unacknowledged deliveries a consumer may hold.
    pub prefetch: u16,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AMQP_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Log broker (stream channel) settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Comma-separated list of broker addresses.
    pub bootstrap_servers: String,
    /// Security protocol.
    pub security_protocol: SecurityProtocol,
    /// SASL credentials (required if using SASL).
    pub sasl: Option<SaslCredentials>,
    /// Client identifier.
    pub client_id: String,
}

impl StreamConfig {
    /// Plaintext configuration for the given brokers.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

/// Complete event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Identifier of the producing service, stamped as `source`.
    pub source: String,
    /// Queue broker settings.
    pub reliable: ReliableConfig,
    /// Log broker settings.
    pub stream: StreamConfig,
    /// Default consumer group id for both channels.
    pub consumer_group: String,
    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,
    /// Default durability policy for publishes.
    pub durability: DurabilityPolicy,
    /// Default requeue flag when a reliable handler fails.
    pub requeue_on_error: bool,
    /// Reconnect policy for dropped connections.
    pub reconnect: RetryPolicy,
    /// How long `disconnect` waits for in-flight handlers.
    pub shutdown_grace: Duration,
}

impl EventBusConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KAFKA_BOOTSTRAP_SERVERS`: Comma-separated broker list
    ///
    /// Optional:
    /// - `EVENT_BUS_SOURCE`: Producing service id (default: "skillhub")
    /// - `AMQP_URL`: Queue broker URL (default: `amqp://127.0.0.1:5672/%2f`)
    /// - `EVENT_BUS_EXCHANGE`: Topic exchange name (default: "skillhub.events")
    /// - `EVENT_BUS_PREFETCH`: Consumer prefetch (default: 16)
    /// - `KAFKA_CLIENT_ID`: Client identifier (default: "skillhub-events")
    /// - `KAFKA_SECURITY_PROTOCOL`: PLAINTEXT (default), SSL, `SASL_PLAINTEXT`, `SASL_SSL`
    /// - `KAFKA_SASL_MECHANISM`, `KAFKA_SASL_USERNAME`, `KAFKA_SASL_PASSWORD` (required if SASL)
    /// - `EVENT_BUS_CONSUMER_GROUP`: Default consumer group (default: "skillhub")
    /// - `EVENT_BUS_PUBLISH_TIMEOUT_MS`: Publish timeout (default: 5000)
    /// - `EVENT_BUS_DURABILITY`: `require-reliable` (default) or `require-both`
    /// - `EVENT_BUS_REQUEUE_ON_ERROR`: true (default) or false
    /// - `EVENT_BUS_SHUTDOWN_GRACE_MS`: Shutdown grace period (default: 10000)
    pub fn from_env() -> Result<Self, EventError> {
        let bootstrap_servers =
            env::var("KAFKA_BOOTSTRAP_SERVERS").map_err(|_| EventError::ConfigMissing {
                var: "KAFKA_BOOTSTRAP_SERVERS".to_string(),
            })?;

        let security_protocol = match env::var("KAFKA_SECURITY_PROTOCOL") {
            Ok(v) => SecurityProtocol::from_str(&v)?,
            Err(_) => SecurityProtocol::Plaintext,
        };

        let sasl = if security_protocol.requires_sasl() {
            Some(SaslCredentials {
                mechanism: SaslMechanism::from_str(&required_var("KAFKA_SASL_MECHANISM")?)?,
                username: required_var("KAFKA_SASL_USERNAME")?,
                password: required_var("KAFKA_SASL_PASSWORD")?,
            })
        } else {
            None
        };

        let durability = match env::var("EVENT_BUS_DURABILITY") {
            Ok(v) => DurabilityPolicy::from_str(&v)?,
            Err(_) => DurabilityPolicy::default(),
        };

        Ok(Self {
            source: env::var("EVENT_BUS_SOURCE").unwrap_or_else(|_| DEFAULT_SOURCE.to_string()),
            reliable: ReliableConfig {
                url: env::var("AMQP_URL").unwrap_or_else(|_| DEFAULT_AMQP_URL.to_string()),
                exchange: env::var("EVENT_BUS_EXCHANGE")
                    .unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string()),
                prefetch: parsed_var("EVENT_BUS_PREFETCH", DEFAULT_PREFETCH)?,
            },
            stream: StreamConfig {
                bootstrap_servers,
                security_protocol,
                sasl,
                client_id: env::var("KAFKA_CLIENT_ID")
                    .unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string()),
            },
            consumer_group: env::var("EVENT_BUS_CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            publish_timeout: Duration::from_millis(parsed_var(
                "EVENT_BUS_PUBLISH_TIMEOUT_MS",
                DEFAULT_PUBLISH_TIMEOUT_MS,
            )?),
            durability,
            requeue_on_error: parsed_var("EVENT_BUS_REQUEUE_ON_ERROR", true)?,
            reconnect: RetryPolicy::default(),
            shutdown_grace: Duration::from_millis(parsed_var(
                "EVENT_BUS_SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )?),
        })
    }

    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> EventBusConfigBuilder {
        EventBusConfigBuilder::new()
    }
}

fn required_var(var: &str) -> Result<String, EventError> {
    env::var(var).map_err(|_| EventError::ConfigMissing {
        var: var.to_string(),
    })
}

fn parsed_var<T>(var: &str, default: T) -> Result<T, EventError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(v) => v.trim().parse().map_err(|e: T::Err| EventError::ConfigInvalid {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Builder for `EventBusConfig`.
#[derive(Debug, Default)]
pub struct EventBusConfigBuilder {
    source: Option<String>,
    amqp_url: Option<String>,
    exchange: Option<String>,
    prefetch: Option<u16>,
    bootstrap_servers: Option<String>,
    security_protocol: Option<SecurityProtocol>,
    sasl: Option<SaslCredentials>,
    client_id: Option<String>,
    consumer_group: Option<String>,
    publish_timeout: Option<Duration>,
    durability: Option<DurabilityPolicy>,
    requeue_on_error: Option<bool>,
    reconnect: Option<RetryPolicy>,
    shutdown_grace: Option<Duration>,
}

impl EventBusConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the producing service id.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the queue broker URL.
    pub fn amqp_url(mut self, url: impl Into<String>) -> Self {
        self.amqp_url = Some(url.into());
        self
    }

    /// Set the topic exchange name.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Set the consumer prefetch.
    #[must_use]
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Set bootstrap servers.
    pub fn bootstrap_servers(mut self, servers: impl Into<String>) -> Self {
        self.bootstrap_servers = Some(servers.into());
        self
    }

    /// Set security protocol.
    #[must_use]
    pub fn security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = Some(protocol);
        self
    }

    /// Set SASL credentials.
    #[must_use]
    pub fn sasl(mut self, mechanism: SaslMechanism, username: String, password: String) -> Self {
        self.sasl = Some(SaslCredentials {
            mechanism,
            username,
            password,
        });
        self
    }

    /// Set client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Set the default consumer group.
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Set the publish timeout.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    /// Set the default durability policy.
    #[must_use]
    pub fn durability(mut self, policy: DurabilityPolicy) -> Self {
        self.durability = Some(policy);
        self
    }

    /// Set the default requeue-on-error flag.
    #[must_use]
    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = Some(requeue);
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<EventBusConfig, EventError> {
        let bootstrap_servers = self.bootstrap_servers.ok_or(EventError::ConfigMissing {
            var: "bootstrap_servers".to_string(),
        })?;

        let security_protocol = self
            .security_protocol
            .unwrap_or(SecurityProtocol::Plaintext);

        if security_protocol.requires_sasl() && self.sasl.is_none() {
            return Err(EventError::ConfigMissing {
                var: "sasl_credentials".to_string(),
            });
        }

        let exchange = self
            .exchange
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
        if exchange.trim().is_empty() {
            return Err(EventError::ConfigInvalid {
                var: "exchange".to_string(),
                reason: "exchange name is empty".to_string(),
            });
        }

        let publish_timeout = self
            .publish_timeout
            .unwrap_or(Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS));
        if publish_timeout.is_zero() {
            return Err(EventError::ConfigInvalid {
                var: "publish_timeout".to_string(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        Ok(EventBusConfig {
            source: self.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            reliable: ReliableConfig {
                url: self.amqp_url.unwrap_or_else(|| DEFAULT_AMQP_URL.to_string()),
                exchange,
                prefetch: self.prefetch.unwrap_or(DEFAULT_PREFETCH),
            },
            stream: StreamConfig {
                bootstrap_servers,
                security_protocol,
                sasl: self.sasl,
                client_id: self
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            },
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            publish_timeout,
            durability: self.durability.unwrap_or_default(),
            requeue_on_error: self.requeue_on_error.unwrap_or(true),
            reconnect: self.reconnect.unwrap_or_default(),
            shutdown_grace: self
                .shutdown_grace
                .unwrap_or(Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS)),
        })
    }
}
