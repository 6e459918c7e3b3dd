use serde::{Deserialize, Serialize};

/// Close codes sent with the final WebSocket close frame.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const SLOW_CONSUMER: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const EVICTED: u16 = 4010;
    pub const LIMIT_EXCEEDED: u16 = 4029;
}

/// Longest topic name accepted from clients or producers, in bytes.
pub const MAX_TOPIC_LEN: usize = 128;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
    Pong,
}

/// Frames the server writes to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    Ready {
        session_id: &'a str,
        user_id: &'a str,
    },
    Event {
        topic: &'a str,
        data: &'a serde_json::Value,
    },
    Subscribed {
        topic: &'a str,
    },
    Unsubscribed {
        topic: &'a str,
    },
    Ping,
    Pong,
    Error {
        reason: &'a str,
    },
}

impl ServerFrame<'_> {
    pub fn to_json(&self) -> String {
        // Every variant is plain strings and a `Value`, which cannot fail to encode.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// Why a session left the admitted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The client closed the connection.
    PeerClosed,
    /// A read or write on the connection failed.
    ConnectionLost,
    /// Too many consecutive events dropped on a full outbound queue.
    SlowConsumer,
    /// No inbound frames for the idle interval.
    KeepaliveTimeout,
    /// A ping went unanswered past the heartbeat timeout.
    HeartbeatTimeout,
    ServerShutdown,
    /// Evicted by an operator or application call.
    Requested,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::PeerClosed => "peer closed",
            EvictReason::ConnectionLost => "connection lost",
            EvictReason::SlowConsumer => "slow consumer",
            EvictReason::KeepaliveTimeout => "keepalive timeout",
            EvictReason::HeartbeatTimeout => "heartbeat timeout",
            EvictReason::ServerShutdown => "server shutdown",
            EvictReason::Requested => "evicted",
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            EvictReason::PeerClosed | EvictReason::ConnectionLost => close_code::NORMAL,
            EvictReason::SlowConsumer => close_code::SLOW_CONSUMER,
            EvictReason::KeepaliveTimeout | EvictReason::HeartbeatTimeout => {
                close_code::SESSION_TIMED_OUT
            }
            EvictReason::ServerShutdown => close_code::GOING_AWAY,
            EvictReason::Requested => close_code::EVICTED,
        }
    }

    /// Whether a close frame is still worth sending; the peer is already
    /// gone in the other cases.
    pub fn sends_close_frame(&self) -> bool {
        !matches!(self, EvictReason::PeerClosed | EvictReason::ConnectionLost)
    }
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a topic name before it reaches the registry.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic must not be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic is too long");
    }
    if topic.chars().any(char::is_control) {
        return Err("topic contains control characters");
    }
    Ok(())
}
