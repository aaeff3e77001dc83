use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    Http1,
    Http2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtocolPolicy {
    /// HTTP/1.1, upgraded to HTTP/2 when TLS ALPN agrees on it.
    #[default]
    Negotiate,
    Forced(ProtocolVersion),
}

/// Connection-level settings of [`crate::HyperTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub protocol: ProtocolPolicy,
    pub dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub response_header_timeout: Duration,
    pub max_connections_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolPolicy::Negotiate,
            dial_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(30),
            max_connections_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    pub fn with_protocol(mut self, protocol: ProtocolPolicy) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_tls_handshake_timeout(mut self, tls_handshake_timeout: Duration) -> Self {
        self.tls_handshake_timeout = tls_handshake_timeout;
        self
    }

    pub fn with_response_header_timeout(mut self, response_header_timeout: Duration) -> Self {
        self.response_header_timeout = response_header_timeout;
        self
    }

    pub fn with_max_connections_per_host(mut self, max_connections_per_host: usize) -> Self {
        self.max_connections_per_host = max_connections_per_host.max(1);
        self
    }

    pub fn with_pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn with_pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub retry_policy: RetryPolicy,
    pub max_response_body_bytes: usize,
    pub max_redirects: usize,
    pub transport: TransportConfig,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                retry_policy: RetryPolicy::standard(),
                max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
                max_redirects: DEFAULT_MAX_REDIRECTS,
                transport: TransportConfig::default(),
            },
            Self::LowLatency => ProfileDefaults {
                retry_policy: RetryPolicy::standard()
                    .count(2)
                    .start_interval(Duration::from_millis(50))
                    .max_interval(Duration::from_millis(300))
                    .total_budget(Duration::from_secs(5)),
                max_response_body_bytes: 2 * 1024 * 1024,
                max_redirects: 5,
                transport: TransportConfig::default()
                    .with_dial_timeout(Duration::from_secs(2))
                    .with_tls_handshake_timeout(Duration::from_secs(2))
                    .with_response_header_timeout(Duration::from_secs(3)),
            },
            Self::HighThroughput => ProfileDefaults {
                retry_policy: RetryPolicy::standard()
                    .start_interval(Duration::from_millis(150))
                    .max_interval(Duration::from_secs(3)),
                max_response_body_bytes: 32 * 1024 * 1024,
                max_redirects: DEFAULT_MAX_REDIRECTS,
                transport: TransportConfig::default()
                    .with_max_connections_per_host(128)
                    .with_pool_max_idle_per_host(128),
            },
        }
    }
}
