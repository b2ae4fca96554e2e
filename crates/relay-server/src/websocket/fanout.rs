//! Cross-instance frame distribution over redis pub/sub.
//!
//! Each server instance publishes every routed frame to one shared
//! channel and subscribes to the same channel. Published frames carry
//! the publishing instance's origin id; a subscriber skips frames with
//! its own origin, so every frame is delivered to each local recipient
//! exactly once regardless of instance count. Addressed frames carry a
//! recipient id and are routed as direct sends on the receiving side,
//! which is how a direct message reaches a user connected to a
//! different instance.
//!
//! Without redis, fan-out degrades to local-only delivery through the
//! hub and the subscriber task is never spawned.

use futures::StreamExt;
use metrics::counter;
use redis::AsyncCommands;
use relay_core::{Envelope, UserId};
use relay_store::{RedisHandle, CHANNEL_FANOUT};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::FANOUT_PUBLISH_ERRORS_TOTAL;
use crate::websocket::hub::{Frame, HubHandle};

/// Delay before re-establishing a dropped pub/sub connection.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Wire form of a published frame. `Cow` because the embedded frame is
/// JSON-in-JSON and deserializes with escapes.
#[derive(Debug, Serialize, Deserialize)]
struct FanoutFrame<'a> {
    /// Publishing instance; subscribers skip their own.
    #[serde(borrow)]
    origin: Cow<'a, str>,
    /// Recipient user id for addressed frames, `0` for broadcasts.
    to_user_id: i64,
    /// The encoded client-facing frame, passed through verbatim.
    #[serde(borrow)]
    frame: Cow<'a, str>,
}

/// Publisher plus local-delivery front for routed frames.
pub struct Fanout {
    redis: Option<RedisHandle>,
    hub: HubHandle,
    origin: String,
}

impl Fanout {
    /// Build the fan-out for this instance. `redis: None` means
    /// local-only delivery.
    pub fn new(redis: Option<RedisHandle>, hub: HubHandle) -> Arc<Self> {
        Arc::new(Self {
            redis,
            hub,
            origin: uuid::Uuid::now_v7().to_string(),
        })
    }

    /// Deliver a frame to every local connection and publish it for the
    /// other instances.
    ///
    /// Local delivery is non-blocking because this is called from inside
    /// the hub loop (presence status frames); awaiting hub-queue space
    /// there would deadlock.
    pub async fn broadcast(&self, frame: Frame) {
        if !self.hub.try_broadcast(Arc::clone(&frame)) {
            warn!("hub queue full, local broadcast dropped");
        }
        self.publish(0, &frame).await;
    }

    /// Deliver a frame to one user's local connection (if any) and
    /// publish it addressed, so the instance holding that user's
    /// connection delivers it too.
    pub async fn direct(&self, to: UserId, frame: Frame) {
        if !self.hub.try_direct(to, Arc::clone(&frame)) {
            warn!(%to, "hub queue full, local direct frame dropped");
        }
        self.publish(to.0, &frame).await;
    }

    /// Encode and broadcast an envelope. Encoding an [`Envelope`] cannot
    /// produce invalid JSON; a failure here is logged and the frame
    /// dropped.
    pub async fn broadcast_envelope(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(encoded) => self.broadcast(Arc::from(encoded.as_str())).await,
            Err(err) => warn!(%err, "failed to encode envelope for broadcast"),
        }
    }

    async fn publish(&self, to_user_id: i64, frame: &str) {
        let Some(redis) = &self.redis else {
            return;
        };
        let wire = FanoutFrame {
            origin: Cow::Borrowed(self.origin.as_str()),
            to_user_id,
            frame: Cow::Borrowed(frame),
        };
        let payload = match serde_json::to_string(&wire) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode fan-out frame");
                return;
            }
        };
        let mut conn = redis.connection();
        let published: Result<i64, redis::RedisError> =
            conn.publish(CHANNEL_FANOUT, payload).await;
        if let Err(err) = published {
            counter!(FANOUT_PUBLISH_ERRORS_TOTAL).increment(1);
            warn!(%err, "fan-out publish failed, frame delivered locally only");
        }
    }

    /// Spawn the subscriber task feeding remote frames into the local
    /// hub. Returns `None` without redis.
    ///
    /// The task holds a dedicated pub/sub connection and re-subscribes
    /// after a delay whenever the connection drops.
    pub fn spawn_subscriber(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let fanout = Arc::clone(self);
        let client = fanout.redis.as_ref()?.client().clone();
        Some(tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.subscribe(CHANNEL_FANOUT).await {
                            warn!(%err, "fan-out subscribe failed");
                        } else {
                            info!(channel = CHANNEL_FANOUT, "fan-out subscriber connected");
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                match msg.get_payload::<String>() {
                                    Ok(payload) => fanout.deliver_remote(&payload),
                                    Err(err) => {
                                        warn!(%err, "unreadable fan-out payload");
                                    }
                                }
                            }
                            warn!("fan-out subscription ended, reconnecting");
                        }
                    }
                    Err(err) => {
                        warn!(%err, "fan-out pub/sub connection failed");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        }))
    }

    fn deliver_remote(&self, payload: &str) {
        let wire: FanoutFrame<'_> = match serde_json::from_str(payload) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(%err, "malformed fan-out frame dropped");
                return;
            }
        };
        if wire.origin == self.origin.as_str() {
            // our own publish echoed back; local delivery already happened
            return;
        }
        debug!(origin = %wire.origin, to = wire.to_user_id, "remote frame received");
        let frame: Frame = Arc::from(wire.frame.as_ref());
        let delivered = if wire.to_user_id > 0 {
            self.hub.try_direct(UserId(wire.to_user_id), frame)
        } else {
            self.hub.try_broadcast(frame)
        };
        if !delivered {
            warn!("hub queue full, remote frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::hub::HubCommand;

    #[test]
    fn fanout_frame_round_trips() {
        let wire = FanoutFrame {
            origin: Cow::Borrowed("instance-a"),
            to_user_id: 7,
            frame: Cow::Borrowed(r#"{"type":"message","text":"hi"}"#),
        };
        let payload = serde_json::to_string(&wire).unwrap();
        let parsed: FanoutFrame<'_> = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.origin, "instance-a");
        assert_eq!(parsed.to_user_id, 7);
        assert_eq!(parsed.frame, wire.frame);
    }

    #[tokio::test]
    async fn own_origin_frames_are_skipped() {
        let (hub, mut rx) = HubHandle::channel();
        let fanout = Fanout::new(None, hub);

        let own = serde_json::to_string(&FanoutFrame {
            origin: Cow::Borrowed(fanout.origin.as_str()),
            to_user_id: 0,
            frame: Cow::Borrowed("{}"),
        })
        .unwrap();
        fanout.deliver_remote(&own);
        assert!(rx.try_recv().is_err(), "self-published frame must not re-deliver");
    }

    #[tokio::test]
    async fn remote_broadcast_feeds_the_hub() {
        let (hub, mut rx) = HubHandle::channel();
        let fanout = Fanout::new(None, hub);

        let remote = serde_json::to_string(&FanoutFrame {
            origin: Cow::Borrowed("someone-else"),
            to_user_id: 0,
            frame: Cow::Borrowed(r#"{"type":"message","text":"hello"}"#),
        })
        .unwrap();
        fanout.deliver_remote(&remote);
        match rx.try_recv() {
            Ok(HubCommand::Broadcast(frame)) => assert!(frame.contains("hello")),
            _ => panic!("expected a broadcast command"),
        }
    }

    #[tokio::test]
    async fn remote_addressed_frame_becomes_a_direct_send() {
        let (hub, mut rx) = HubHandle::channel();
        let fanout = Fanout::new(None, hub);

        let remote = serde_json::to_string(&FanoutFrame {
            origin: Cow::Borrowed("someone-else"),
            to_user_id: 42,
            frame: Cow::Borrowed(r#"{"type":"message","text":"for you"}"#),
        })
        .unwrap();
        fanout.deliver_remote(&remote);
        match rx.try_recv() {
            Ok(HubCommand::Direct { to, frame }) => {
                assert_eq!(to, UserId(42));
                assert!(frame.contains("for you"));
            }
            _ => panic!("expected a direct command"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let (hub, mut rx) = HubHandle::channel();
        let fanout = Fanout::new(None, hub);
        fanout.deliver_remote("not json");
        assert!(rx.try_recv().is_err());
    }
}
