/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_address: String,
    /// SQLite database URL
    pub database_url: String,
    /// Directory for static web files
    pub static_dir: String,
    /// MQTT TLS port on the printers
    pub mqtt_port: u16,
    /// MQTT username (Bambu LAN mode is always `bblp`)
    pub mqtt_user: String,
    /// Default RPC timeout
    pub command_timeout_ms: u64,
    /// Reconnect backoff lower bound
    pub reconnect_min_ms: u64,
    /// Reconnect backoff upper bound
    pub reconnect_max_ms: u64,
    /// Bounded outbound queue per WS subscriber
    pub subscriber_queue_depth: usize,
    /// Slow-consumer markers tolerated per window before eviction
    pub slow_consumer_max_drops_per_window: u32,
    /// Slow-consumer eviction window
    pub slow_consumer_window_ms: u64,
    /// Embedded device liveness timeout
    pub device_heartbeat_timeout_ms: u64,
    /// Minimum interval between pushall requests per printer
    pub pushall_min_interval_ms: u64,
    /// Staged assignment expiry
    pub staged_assignment_ttl_ms: u64,
    /// Maximum time shutdown may spend draining
    pub shutdown_drain_ms: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:spoolbuddy.db?mode=rwc".into()),
            static_dir: std::env::var("STATIC_DIR").unwrap_or_else(|_| "../web/dist".into()),
            mqtt_port: env_parse("SPOOLBUDDY_MQTT_PORT", 8883),
            mqtt_user: std::env::var("SPOOLBUDDY_MQTT_USER").unwrap_or_else(|_| "bblp".into()),
            command_timeout_ms: env_parse("SPOOLBUDDY_COMMAND_TIMEOUT_MS", 5000),
            reconnect_min_ms: env_parse("SPOOLBUDDY_RECONNECT_MIN_MS", 1000),
            reconnect_max_ms: env_parse("SPOOLBUDDY_RECONNECT_MAX_MS", 60000),
            subscriber_queue_depth: env_parse("SPOOLBUDDY_SUBSCRIBER_QUEUE_DEPTH", 256),
            slow_consumer_max_drops_per_window: env_parse("SPOOLBUDDY_SLOW_CONSUMER_MAX_DROPS", 3),
            slow_consumer_window_ms: env_parse("SPOOLBUDDY_SLOW_CONSUMER_WINDOW_MS", 30000),
            device_heartbeat_timeout_ms: env_parse("SPOOLBUDDY_DEVICE_HEARTBEAT_TIMEOUT_MS", 15000),
            pushall_min_interval_ms: env_parse("SPOOLBUDDY_PUSHALL_MIN_INTERVAL_MS", 2000),
            staged_assignment_ttl_ms: env_parse("SPOOLBUDDY_STAGED_ASSIGNMENT_TTL_MS", 3_600_000),
            shutdown_drain_ms: env_parse("SPOOLBUDDY_SHUTDOWN_DRAIN_MS", 10000),
        }
    }
}
