//! Per-session read and write pumps.
//!
//! The hub is the only thing that decides a session is over. Pumps that hit
//! a failure ask the hub to evict and then wait for the close signal like
//! everyone else, so the teardown path is the same no matter who starts it.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{ClientFrame, EvictReason, ServerFrame};
use super::heartbeat::Heartbeat;
use super::hub::{Admission, Frame, HubHandle};
use crate::error::HubError;

/// Identity shared by both pumps of one session.
#[derive(Clone)]
struct SessionCtx {
    session_id: Arc<str>,
    user_id: Arc<str>,
    hub: HubHandle,
}

impl SessionCtx {
    fn evict(&self, reason: EvictReason) {
        self.hub.schedule_eviction(&self.session_id, reason);
    }
}

/// Drive an admitted session until the hub closes it.
pub async fn serve(socket: WebSocket, hub: HubHandle, admission: Admission) {
    let Admission {
        session_id,
        user_id,
        outbound,
        replies,
        closed,
    } = admission;

    // The queue is empty at admission, so the ready frame always fits.
    let ready = ServerFrame::Ready {
        session_id: &session_id,
        user_id: &user_id,
    };
    let _ = replies.try_send(Arc::from(ready.to_json()));

    let ctx = SessionCtx {
        session_id: Arc::from(session_id),
        user_id: Arc::from(user_id),
        hub: hub.clone(),
    };
    let (sink, stream) = socket.split();
    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let force = hub.force_close_token();

    let writer = hub.tasks().spawn(write_pump(
        ctx.clone(),
        sink,
        outbound,
        closed.clone(),
        pong_rx,
        force.clone(),
    ));
    let reader = hub
        .tasks()
        .spawn(read_pump(ctx.clone(), stream, replies, closed, pong_tx, force));

    let (w, r) = tokio::join!(writer, reader);
    if w.is_err() || r.is_err() {
        warn!(session_id = %ctx.session_id, "session pump panicked");
        ctx.evict(EvictReason::ConnectionLost);
    }
    debug!(session_id = %ctx.session_id, user_id = %ctx.user_id, "session ended");
}

async fn read_pump(
    ctx: SessionCtx,
    mut stream: SplitStream<WebSocket>,
    replies: mpsc::Sender<Frame>,
    mut closed: watch::Receiver<Option<EvictReason>>,
    pong_tx: watch::Sender<Instant>,
    force: CancellationToken,
) {
    let idle_timeout = ctx.hub.config().idle_timeout;

    loop {
        tokio::select! {
            _ = force.cancelled() => break,
            _ = async { let _ = closed.wait_for(Option::is_some).await; } => break,
            next = tokio::time::timeout(idle_timeout, stream.next()) => {
                let msg = match next {
                    Err(_) => {
                        ctx.evict(EvictReason::KeepaliveTimeout);
                        break;
                    }
                    Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                        ctx.evict(EvictReason::PeerClosed);
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        debug!(session_id = %ctx.session_id, error = %e, "read failed");
                        ctx.evict(EvictReason::ConnectionLost);
                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    Message::Text(text) => handle_frame(&ctx, &replies, &pong_tx, text.as_str()).await,
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handle_frame(&ctx, &replies, &pong_tx, text).await,
                        Err(_) => warn!(session_id = %ctx.session_id, "protocol violation: binary frame is not UTF-8"),
                    },
                    Message::Pong(_) => {
                        pong_tx.send_replace(Instant::now());
                    }
                    // Transport pings are answered by the WebSocket layer.
                    Message::Ping(_) | Message::Close(_) => {}
                }
            }
        }
    }
}

async fn handle_frame(
    ctx: &SessionCtx,
    replies: &mpsc::Sender<Frame>,
    pong_tx: &watch::Sender<Instant>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session_id = %ctx.session_id, error = %e, "protocol violation: malformed frame ignored");
            return;
        }
    };

    // Subscription acks are queued by the hub itself, ahead of any event
    // for the topic. Only failures are answered from here.
    let reply = match frame {
        ClientFrame::Subscribe { topic } => {
            match ctx.hub.subscribe_acked(&ctx.session_id, &topic).await {
                Ok(_) => return,
                Err(e) => error_frame(&e),
            }
        }
        ClientFrame::Unsubscribe { topic } => {
            match ctx.hub.unsubscribe_acked(&ctx.session_id, &topic).await {
                Ok(_) => return,
                Err(e) => error_frame(&e),
            }
        }
        ClientFrame::Ping => ServerFrame::Pong.to_json(),
        ClientFrame::Pong => {
            pong_tx.send_replace(Instant::now());
            return;
        }
    };

    // Replies share the outbound queue with events; when it is full the
    // session is already on its way to a slow-consumer eviction.
    if replies.try_send(Arc::from(reply)).is_err() {
        debug!(session_id = %ctx.session_id, "reply dropped, outbound queue full");
    }
}

fn error_frame(err: &HubError) -> String {
    ServerFrame::Error {
        reason: &err.to_string(),
    }
    .to_json()
}

async fn write_pump(
    ctx: SessionCtx,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<Option<EvictReason>>,
    mut pongs: watch::Receiver<Instant>,
    force: CancellationToken,
) {
    let config = ctx.hub.config();
    let mut heartbeat = Heartbeat::new(config.heartbeat_interval, config.heartbeat_timeout);
    let mut ticker = tokio::time::interval_at(
        Instant::now() + heartbeat.interval(),
        heartbeat.interval(),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut timed_out = false;

    let reason = loop {
        let expiry = if timed_out { None } else { heartbeat.deadline() };

        tokio::select! {
            biased;
            _ = force.cancelled() => break None,
            reason = async { closed.wait_for(Option::is_some).await.ok().and_then(|r| *r) } => break reason,
            _ = sleep_until_some(expiry) => {
                heartbeat.pong_received(*pongs.borrow_and_update());
                if heartbeat.is_overdue(Instant::now()) {
                    timed_out = true;
                    ctx.evict(EvictReason::HeartbeatTimeout);
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break None;
                };
                if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                    debug!(session_id = %ctx.session_id, error = %e, "write failed");
                    ctx.evict(EvictReason::ConnectionLost);
                    break None;
                }
            }
            _ = ticker.tick() => {
                if timed_out {
                    continue;
                }
                heartbeat.pong_received(*pongs.borrow_and_update());
                let now = Instant::now();
                if sink.send(Message::Text(ServerFrame::Ping.to_json().into())).await.is_err() {
                    ctx.evict(EvictReason::ConnectionLost);
                    break None;
                }
                heartbeat.ping_sent(now);
            }
        }
    };

    if let Some(reason) = reason {
        if reason.sends_close_frame() {
            let close = CloseFrame {
                code: reason.close_code(),
                reason: Utf8Bytes::from_static(reason.as_str()),
            };
            let _ = sink.send(Message::Close(Some(close))).await;
        }
    }
    let _ = sink.close().await;
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
