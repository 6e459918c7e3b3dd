use std::time::Duration;

const DEFAULT_PORT: u16 = 39100;
const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";

/// Upper bound for every hub timing. Larger values overflow `Instant` math.
const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_QUEUE_CAPACITY: usize = 1 << 16;

/// Limits and timings the hub control loop and session pumps run with.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections_per_user: usize,
    pub max_topics_per_session: usize,
    pub queue_capacity: usize,
    /// Consecutive dropped events before a session is evicted as a slow consumer.
    pub slow_consumer_threshold: u32,
    pub heartbeat_interval: Duration,
    /// How long a sent ping may stay unanswered.
    pub heartbeat_timeout: Duration,
    /// Inbound inactivity after which the read pump gives up.
    pub idle_timeout: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            max_topics_per_session: 50,
            queue_capacity: 64,
            slow_consumer_threshold: 3,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    /// Clamp values that would make the hub unusable. A zero-capacity queue
    /// panics in tokio and a zero limit rejects everyone. Timings are capped
    /// at one day.
    pub fn normalized(mut self) -> Self {
        self.max_connections_per_user = self.max_connections_per_user.max(1);
        self.max_topics_per_session = self.max_topics_per_session.max(1);
        self.queue_capacity = self.queue_capacity.clamp(1, MAX_QUEUE_CAPACITY);
        self.slow_consumer_threshold = self.slow_consumer_threshold.max(1);
        self.heartbeat_interval = self
            .heartbeat_interval
            .clamp(Duration::from_millis(1), MAX_TIMING);
        self.heartbeat_timeout = self.heartbeat_timeout.min(MAX_TIMING);
        self.idle_timeout = self.idle_timeout.min(MAX_TIMING);
        self.shutdown_deadline = self.shutdown_deadline.min(MAX_TIMING);
        self
    }
}

pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    /// Shared key producers present on `POST /api/v1/publish`. Unset disables the endpoint.
    pub publish_key: Option<String>,
    /// Publish requests per minute allowed per key.
    pub publish_rate_limit: u32,
    pub hub: HubConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = HubConfig::default();

        let hub = HubConfig {
            max_connections_per_user: env_parse("INTELHUB_MAX_CONNECTIONS_PER_USER")
                .unwrap_or(defaults.max_connections_per_user),
            max_topics_per_session: env_parse("INTELHUB_MAX_TOPICS_PER_SESSION")
                .unwrap_or(defaults.max_topics_per_session),
            queue_capacity: env_parse("INTELHUB_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            slow_consumer_threshold: env_parse("INTELHUB_SLOW_CONSUMER_THRESHOLD")
                .unwrap_or(defaults.slow_consumer_threshold),
            heartbeat_interval: env_secs(
                "INTELHUB_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env_secs(
                "INTELHUB_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            idle_timeout: env_secs("INTELHUB_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            shutdown_deadline: env_secs(
                "INTELHUB_SHUTDOWN_DEADLINE_SECS",
                defaults.shutdown_deadline,
            ),
        }
        .normalized();

        Self {
            port: env_parse("PORT").unwrap_or(DEFAULT_PORT),
            jwt_secret: std::env::var("INTELHUB_JWT_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_JWT_SECRET.to_string()),
            publish_key: std::env::var("INTELHUB_PUBLISH_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            publish_rate_limit: env_parse::<u32>("INTELHUB_PUBLISH_RATE_LIMIT")
                .unwrap_or(120)
                .max(1),
            hub,
        }
    }

    /// True when the signing secret is still the built-in development value.
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }
}
