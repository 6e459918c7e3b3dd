//! The hub control loop.
//!
//! One task owns the session table, the topic registry and the per-user
//! connection counts. Everything else talks to it through [`HubHandle`],
//! which turns each call into a [`Command`] on a bounded channel, so
//! admissions, subscriptions, publishes and evictions are applied one at a
//! time in arrival order and never observe each other half-done.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::events::{validate_topic, EvictReason, ServerFrame};
use super::topics::TopicRegistry;
use crate::config::HubConfig;
use crate::error::{HubError, Limit};

/// A serialized server frame, shared between every queue it is fanned out to.
pub type Frame = Arc<str>;

/// Grace period for pumps to notice a forced close before shutdown returns.
const FORCED_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Commands that may wait for the control loop before callers back off.
const COMMAND_BUFFER: usize = 1024;

/// Handed to the connection layer when a session is admitted.
#[derive(Debug)]
pub struct Admission {
    pub session_id: String,
    pub user_id: String,
    /// The session's bounded outbound queue, drained by the write pump.
    pub outbound: mpsc::Receiver<Frame>,
    /// Sender side of the same queue, for replies the session queues itself.
    pub replies: mpsc::Sender<Frame>,
    /// Set once by the hub when the session is evicted.
    pub closed: watch::Receiver<Option<EvictReason>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub topic: String,
    /// Sessions subscribed when the hub processed the publish.
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Sessions removed during this publish (slow consumers, dead queues).
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub users: usize,
    pub topics: usize,
    pub shutting_down: bool,
    pub published_total: u64,
    pub delivered_total: u64,
    pub dropped_total: u64,
    pub evicted_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSummary {
    pub topic: String,
    pub subscribers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub topics: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub dropped_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub evicted: usize,
    /// Pumps were still running at the deadline and had to be cut off.
    pub forced: bool,
}

enum Command {
    Admit {
        user_id: String,
        reply: oneshot::Sender<Result<Admission, HubError>>,
    },
    Subscribe {
        session_id: String,
        topic: String,
        /// Queue the `subscribed` frame on the session before replying.
        ack: bool,
        reply: oneshot::Sender<Result<bool, HubError>>,
    },
    Unsubscribe {
        session_id: String,
        topic: String,
        ack: bool,
        reply: oneshot::Sender<Result<bool, HubError>>,
    },
    Publish {
        topic: String,
        data: serde_json::Value,
        reply: Option<oneshot::Sender<PublishReport>>,
    },
    Evict {
        session_id: String,
        reason: EvictReason,
        reply: Option<oneshot::Sender<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Topics {
        reply: oneshot::Sender<Vec<TopicSummary>>,
    },
    Session {
        session_id: String,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    UserSessions {
        user_id: String,
        reply: oneshot::Sender<usize>,
    },
}

struct SessionEntry {
    user_id: String,
    topics: HashSet<String>,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<Option<EvictReason>>,
    consecutive_drops: u32,
    dropped_total: u64,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    published: u64,
    delivered: u64,
    dropped: u64,
    evicted: u64,
}

/// State owned by the control loop task.
pub struct Hub {
    config: HubConfig,
    sessions: HashMap<String, SessionEntry>,
    topics: TopicRegistry,
    user_sessions: HashMap<String, usize>,
    shutting_down: bool,
    counters: Counters,
}

impl Hub {
    /// Start the control loop on the current runtime and return a handle to it.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let hub = Hub {
            config: config.clone(),
            sessions: HashMap::new(),
            topics: TopicRegistry::new(),
            user_sessions: HashMap::new(),
            shutting_down: false,
            counters: Counters::default(),
        };
        tokio::spawn(hub.run(rx));

        HubHandle {
            commands: tx,
            tasks: TaskTracker::new(),
            force_close: CancellationToken::new(),
            config: Arc::new(config),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
        debug!(sessions = self.sessions.len(), "hub control loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { user_id, reply } => {
                let result = self.admit(user_id);
                // The caller went away before the session could start; undo it.
                if let Err(Ok(orphan)) = reply.send(result) {
                    self.evict(&orphan.session_id, EvictReason::ConnectionLost);
                }
            }
            Command::Subscribe {
                session_id,
                topic,
                ack,
                reply,
            } => {
                let result = self.subscribe(&session_id, &topic);
                if ack && result.is_ok() {
                    self.queue_ack(&session_id, ServerFrame::Subscribed { topic: &topic });
                }
                let _ = reply.send(result);
            }
            Command::Unsubscribe {
                session_id,
                topic,
                ack,
                reply,
            } => {
                let result = self.unsubscribe(&session_id, &topic);
                if ack && result.is_ok() {
                    self.queue_ack(&session_id, ServerFrame::Unsubscribed { topic: &topic });
                }
                let _ = reply.send(result);
            }
            Command::Publish { topic, data, reply } => {
                let report = self.publish(&topic, &data);
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::Evict {
                session_id,
                reason,
                reply,
            } => {
                let evicted = self.evict(&session_id, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(evicted);
                }
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.begin_shutdown());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Topics { reply } => {
                let topics = self
                    .topics
                    .summary()
                    .into_iter()
                    .map(|(topic, subscribers)| TopicSummary { topic, subscribers })
                    .collect();
                let _ = reply.send(topics);
            }
            Command::Session { session_id, reply } => {
                let _ = reply.send(self.session_info(&session_id));
            }
            Command::UserSessions { user_id, reply } => {
                let _ = reply.send(self.user_sessions.get(&user_id).copied().unwrap_or(0));
            }
        }
    }

    fn admit(&mut self, user_id: String) -> Result<Admission, HubError> {
        if self.shutting_down {
            return Err(HubError::ShuttingDown);
        }

        let max = self.config.max_connections_per_user;
        let current = self.user_sessions.get(&user_id).copied().unwrap_or(0);
        if current >= max {
            warn!(user_id, current, max, "admission rejected: connection limit");
            return Err(HubError::LimitExceeded(Limit::ConnectionsPerUser { max }));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity);
        let (closed_tx, closed_rx) = watch::channel(None);

        *self.user_sessions.entry(user_id.clone()).or_insert(0) += 1;
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                user_id: user_id.clone(),
                topics: HashSet::new(),
                outbound: outbound_tx.clone(),
                closed: closed_tx,
                consecutive_drops: 0,
                dropped_total: 0,
                connected_at: Utc::now(),
            },
        );
        info!(session_id, user_id, user_sessions = current + 1, "session admitted");

        Ok(Admission {
            session_id,
            user_id,
            outbound: outbound_rx,
            replies: outbound_tx,
            closed: closed_rx,
        })
    }

    fn subscribe(&mut self, session_id: &str, topic: &str) -> Result<bool, HubError> {
        if self.shutting_down {
            return Err(HubError::ShuttingDown);
        }
        validate_topic(topic).map_err(|e| HubError::InvalidTopic(e.to_string()))?;

        let max = self.config.max_topics_per_session;
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or(HubError::UnknownSession)?;
        if entry.topics.contains(topic) {
            return Ok(false);
        }
        if entry.topics.len() >= max {
            warn!(session_id, topic, max, "subscribe rejected: topic limit");
            return Err(HubError::LimitExceeded(Limit::TopicsPerSession { max }));
        }

        self.topics.subscribe(topic, session_id);
        debug!(session_id, topic, "subscribed");
        entry.topics.insert(topic.to_string());
        Ok(true)
    }

    fn unsubscribe(&mut self, session_id: &str, topic: &str) -> Result<bool, HubError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or(HubError::UnknownSession)?;
        if !entry.topics.remove(topic) {
            return Ok(false);
        }
        self.topics.unsubscribe(topic, session_id);
        debug!(session_id, topic, "unsubscribed");
        Ok(true)
    }

    /// Queue a control reply on the session's outbound queue. A full queue
    /// drops it; the session is then already close to a slow-consumer eviction.
    fn queue_ack(&self, session_id: &str, frame: ServerFrame<'_>) {
        let Some(entry) = self.sessions.get(session_id) else {
            return;
        };
        if entry.outbound.try_send(Arc::from(frame.to_json())).is_err() {
            debug!(session_id, "ack dropped, outbound queue full");
        }
    }

    fn publish(&mut self, topic: &str, data: &serde_json::Value) -> PublishReport {
        self.counters.published += 1;
        let mut report = PublishReport {
            topic: topic.to_string(),
            recipients: 0,
            delivered: 0,
            dropped: 0,
            evicted: 0,
        };

        let Some(subscribers) = self.topics.subscribers(topic) else {
            debug!(topic, "publish to topic without subscribers");
            return report;
        };

        let frame: Frame = Arc::from(ServerFrame::Event { topic, data }.to_json());
        let threshold = self.config.slow_consumer_threshold;
        let mut to_evict = Vec::new();

        for session_id in subscribers {
            let Some(entry) = self.sessions.get_mut(session_id) else {
                continue;
            };
            report.recipients += 1;
            match entry.outbound.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    entry.consecutive_drops = 0;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    entry.consecutive_drops += 1;
                    entry.dropped_total += 1;
                    report.dropped += 1;
                    if entry.consecutive_drops >= threshold {
                        warn!(
                            session_id,
                            topic,
                            drops = entry.consecutive_drops,
                            "evicting slow consumer"
                        );
                        to_evict.push((session_id.clone(), EvictReason::SlowConsumer));
                    } else {
                        warn!(
                            session_id,
                            topic,
                            drops = entry.consecutive_drops,
                            "outbound queue full, event dropped"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    to_evict.push((session_id.clone(), EvictReason::ConnectionLost));
                }
            }
        }

        for (session_id, reason) in to_evict {
            if self.evict(&session_id, reason) {
                report.evicted += 1;
            }
        }

        self.counters.delivered += report.delivered as u64;
        self.counters.dropped += report.dropped as u64;
        debug!(
            topic,
            recipients = report.recipients,
            delivered = report.delivered,
            dropped = report.dropped,
            "published"
        );
        report
    }

    /// Remove a session and everything that references it. Returns `false`
    /// if it was already gone.
    fn evict(&mut self, session_id: &str, reason: EvictReason) -> bool {
        let Some(entry) = self.sessions.remove(session_id) else {
            debug!(session_id, %reason, "eviction of unknown session ignored");
            return false;
        };

        self.topics.remove_session(session_id, &entry.topics);
        if let Entry::Occupied(mut count) = self.user_sessions.entry(entry.user_id.clone()) {
            *count.get_mut() = count.get().saturating_sub(1);
            if *count.get() == 0 {
                count.remove();
            }
        }
        entry.closed.send_replace(Some(reason));
        self.counters.evicted += 1;

        match reason {
            EvictReason::PeerClosed | EvictReason::ServerShutdown | EvictReason::Requested => {
                info!(session_id, user_id = entry.user_id, %reason, "session closed")
            }
            _ => warn!(session_id, user_id = entry.user_id, %reason, "session evicted"),
        }
        true
    }

    fn begin_shutdown(&mut self) -> usize {
        if !self.shutting_down {
            info!(sessions = self.sessions.len(), "hub shutting down");
        }
        self.shutting_down = true;
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in &ids {
            self.evict(id, EvictReason::ServerShutdown);
        }
        ids.len()
    }

    fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            users: self.user_sessions.len(),
            topics: self.topics.topic_count(),
            shutting_down: self.shutting_down,
            published_total: self.counters.published,
            delivered_total: self.counters.delivered,
            dropped_total: self.counters.dropped,
            evicted_total: self.counters.evicted,
        }
    }

    fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = self.sessions.get(session_id)?;
        let mut topics: Vec<String> = entry.topics.iter().cloned().collect();
        topics.sort();
        Some(SessionInfo {
            session_id: session_id.to_string(),
            user_id: entry.user_id.clone(),
            topics,
            connected_at: entry.connected_at,
            dropped_total: entry.dropped_total,
        })
    }
}

/// Cheap, cloneable entry point to the hub control loop.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    tasks: TaskTracker,
    force_close: CancellationToken,
    config: Arc<HubConfig>,
}

impl HubHandle {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Tracks session pumps so shutdown can wait for them.
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Cancelled when shutdown gives up waiting for pumps.
    pub(crate) fn force_close_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| HubError::Unavailable)?;
        rx.await.map_err(|_| HubError::Unavailable)
    }

    /// Admit a new session for an already authenticated user.
    pub async fn admit(&self, user_id: &str) -> Result<Admission, HubError> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::Admit { user_id, reply })
            .await?
    }

    /// Returns `true` if the subscription is new.
    pub async fn subscribe(&self, session_id: &str, topic: &str) -> Result<bool, HubError> {
        self.change_subscription(session_id, topic, true, false)
            .await
    }

    /// Returns `true` if the session was subscribed.
    pub async fn unsubscribe(&self, session_id: &str, topic: &str) -> Result<bool, HubError> {
        self.change_subscription(session_id, topic, false, false)
            .await
    }

    /// Subscribe on behalf of the session itself. On success the hub queues
    /// the `subscribed` frame before any event for the topic can follow it.
    pub(crate) async fn subscribe_acked(
        &self,
        session_id: &str,
        topic: &str,
    ) -> Result<bool, HubError> {
        self.change_subscription(session_id, topic, true, true)
            .await
    }

    /// Unsubscribe on behalf of the session; no event follows the ack.
    pub(crate) async fn unsubscribe_acked(
        &self,
        session_id: &str,
        topic: &str,
    ) -> Result<bool, HubError> {
        self.change_subscription(session_id, topic, false, true)
            .await
    }

    async fn change_subscription(
        &self,
        session_id: &str,
        topic: &str,
        subscribe: bool,
        ack: bool,
    ) -> Result<bool, HubError> {
        let (session_id, topic) = (session_id.to_string(), topic.to_string());
        self.request(|reply| {
            if subscribe {
                Command::Subscribe {
                    session_id,
                    topic,
                    ack,
                    reply,
                }
            } else {
                Command::Unsubscribe {
                    session_id,
                    topic,
                    ack,
                    reply,
                }
            }
        })
        .await?
    }

    /// Fan an event out to the topic's current subscribers without waiting.
    ///
    /// Fails with [`HubError::Overloaded`] instead of queueing when the
    /// control loop is behind, so a publish burst cannot grow memory.
    pub fn publish(&self, topic: &str, data: serde_json::Value) -> Result<(), HubError> {
        let command = Command::Publish {
            topic: topic.to_string(),
            data,
            reply: None,
        };
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(topic, "hub command buffer full, publish rejected");
                Err(HubError::Overloaded)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(topic, "publish after hub stopped");
                Err(HubError::Unavailable)
            }
        }
    }

    /// Like [`publish`](Self::publish) but waits for the fan-out outcome.
    pub async fn publish_with_report(
        &self,
        topic: &str,
        data: serde_json::Value,
    ) -> Result<PublishReport, HubError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish {
            topic,
            data,
            reply: Some(reply),
        })
        .await
    }

    /// Queue an eviction without waiting for it. Used by the pumps.
    ///
    /// Evictions are never dropped: when the buffer is full the command is
    /// handed to a task that waits for room.
    pub fn schedule_eviction(&self, session_id: &str, reason: EvictReason) {
        let command = Command::Evict {
            session_id: session_id.to_string(),
            reason,
            reply: None,
        };
        if let Err(TrySendError::Full(command)) = self.commands.try_send(command) {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                let _ = commands.send(command).await;
            });
        }
    }

    /// Returns `true` if the session was still admitted.
    pub async fn evict(&self, session_id: &str, reason: EvictReason) -> Result<bool, HubError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Evict {
            session_id,
            reason,
            reply: Some(reply),
        })
        .await
    }

    /// Stop admitting, evict every session and wait up to `deadline` for
    /// their pumps to exit before cutting the rest off.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let evicted = self
            .request(|reply| Command::Shutdown { reply })
            .await
            .unwrap_or(0);

        self.tasks.close();
        let forced = tokio::time::timeout(deadline, self.tasks.wait())
            .await
            .is_err();
        if forced {
            warn!(
                remaining = self.tasks.len(),
                ?deadline,
                "shutdown deadline passed, forcing sessions closed"
            );
            self.force_close.cancel();
            let _ = tokio::time::timeout(FORCED_CLOSE_GRACE, self.tasks.wait()).await;
        }
        info!(evicted, forced, "hub shutdown complete");
        ShutdownReport { evicted, forced }
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn topics(&self) -> Result<Vec<TopicSummary>, HubError> {
        self.request(|reply| Command::Topics { reply }).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionInfo>, HubError> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Session { session_id, reply })
            .await
    }

    pub async fn user_session_count(&self, user_id: &str) -> Result<usize, HubError> {
        let user_id = user_id.to_string();
        self.request(|reply| Command::UserSessions { user_id, reply })
            .await
    }
}
