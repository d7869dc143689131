//! Bridge configuration

use std::time::Duration;

/// Configuration for one HTTP/2 bridge session
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised to the client
    pub max_concurrent_streams: u32,
    /// Stream-level initial window is (1 << window_bits) - 1
    pub window_bits: u8,
    /// Connection-level window is (1 << connection_window_bits) - 1;
    /// values above 16 enlarge the default connection window
    pub connection_window_bits: u8,
    /// Operate as a forward HTTP/2 proxy (`:authority` becomes mandatory
    /// and Location rewriting is disabled)
    pub http2_proxy: bool,
    /// Pass origin `via` headers through without appending our own token
    pub no_via: bool,
    /// Token used in `via` and `server` headers
    pub server_name: String,
    /// Client-facing listen port, used when rewriting Location headers
    pub port: u16,
    /// Upper bound on the accumulated raw request header bytes per stream
    pub max_headers_sum: usize,
    /// Client-side read timeout while serving HTTP/2
    pub upstream_read_timeout: Duration,
    /// Client-side write timeout while serving HTTP/2
    pub upstream_write_timeout: Duration,
}

impl BridgeConfig {
    /// Start building a configuration
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Stream-level initial window size derived from `window_bits`
    pub fn initial_window_size(&self) -> u32 {
        (1u32 << self.window_bits) - 1
    }

    /// Connection-level window size derived from `connection_window_bits`
    pub fn connection_window_size(&self) -> u32 {
        (1u32 << self.connection_window_bits) - 1
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfigBuilder::new().build()
    }
}

/// Builder for [`BridgeConfig`]
#[derive(Debug)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a builder with defaults
    pub fn new() -> Self {
        BridgeConfigBuilder {
            config: BridgeConfig {
                max_concurrent_streams: 100,
                window_bits: 16,
                connection_window_bits: 16,
                http2_proxy: false,
                no_via: false,
                server_name: "h2bridge".to_string(),
                port: 443,
                max_headers_sum: 64 * 1024,
                upstream_read_timeout: Duration::from_secs(180),
                upstream_write_timeout: Duration::from_secs(30),
            },
        }
    }

    /// Set SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    /// Set stream window bits (clamped to 16..=30)
    pub fn window_bits(mut self, bits: u8) -> Self {
        self.config.window_bits = bits.clamp(16, 30);
        self
    }

    /// Set connection window bits (clamped to 16..=30)
    pub fn connection_window_bits(mut self, bits: u8) -> Self {
        self.config.connection_window_bits = bits.clamp(16, 30);
        self
    }

    /// Operate as a forward HTTP/2 proxy
    pub fn http2_proxy(mut self, enabled: bool) -> Self {
        self.config.http2_proxy = enabled;
        self
    }

    /// Pass origin `via` headers through unchanged
    pub fn no_via(mut self, enabled: bool) -> Self {
        self.config.no_via = enabled;
        self
    }

    /// Set the server token
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the client-facing listen port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the per-stream raw request header size limit
    pub fn max_headers_sum(mut self, bytes: usize) -> Self {
        self.config.max_headers_sum = bytes;
        self
    }

    /// Set client-side timeouts
    pub fn upstream_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.config.upstream_read_timeout = read;
        self.config.upstream_write_timeout = write;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

impl Default for BridgeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
