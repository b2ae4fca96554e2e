//! The hub: a single coordinating loop that owns the live-connection set.
//!
//! Every other component talks to the hub exclusively through
//! [`HubCommand`]s on one bounded queue, so the four operation kinds
//! (register, unregister, broadcast, direct-send) are applied in exactly
//! the order they arrive — a total order per process, with no lock around
//! the connection set because the loop is its only writer.
//!
//! Backpressure policy: enqueues onto connection mailboxes are always
//! non-blocking. A full mailbox means the receiver is too slow, and the
//! connection is dropped on the spot, identically to an unregister. One
//! stalled client must never stall the hub.

use metrics::{counter, gauge};
use relay_core::{ConnectionId, Envelope, UserId};
use relay_store::PresenceStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{WS_BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_ACTIVE};
use crate::websocket::fanout::Fanout;

/// A routed frame. `Arc` because a broadcast clones it once per mailbox.
pub type Frame = Arc<str>;

/// Outbound mailbox depth. A receiver this far behind is disconnected.
pub const MAILBOX_CAPACITY: usize = 256;

/// Hub command queue depth.
const HUB_QUEUE_CAPACITY: usize = 1024;

/// The hub's view of one live connection: identity plus the sending end
/// of its mailbox. The hub holds the only sender, so removing a
/// connection from the set closes its mailbox.
pub struct ConnectionHandle {
    /// Connection identity.
    pub id: ConnectionId,
    /// Owning user.
    pub user: UserId,
    /// Display name at connect time.
    pub username: String,
    mailbox: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Build a handle and the receiving end of its mailbox.
    pub fn channel(
        id: ConnectionId,
        user: UserId,
        username: &str,
    ) -> (Self, mpsc::Receiver<Frame>) {
        Self::channel_with_capacity(id, user, username, MAILBOX_CAPACITY)
    }

    /// As [`ConnectionHandle::channel`] with an explicit mailbox depth
    /// (tests exercise the full-mailbox policy with tiny mailboxes).
    pub fn channel_with_capacity(
        id: ConnectionId,
        user: UserId,
        username: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (mailbox, rx) = mpsc::channel(capacity);
        (
            Self {
                id,
                user,
                username: username.to_string(),
                mailbox,
            },
            rx,
        )
    }

    fn try_send(&self, frame: Frame) -> bool {
        self.mailbox.try_send(frame).is_ok()
    }
}

/// One of the four operations the hub serializes.
pub enum HubCommand {
    /// Add a connection to the set; mark its user online.
    Register(ConnectionHandle),
    /// Remove a connection if present; mark its user offline. Idempotent.
    Unregister(ConnectionId),
    /// Enqueue a frame onto every local mailbox.
    Broadcast(Frame),
    /// Enqueue a frame onto the mailbox of `to`'s local connection, if any.
    Direct {
        /// Recipient user.
        to: UserId,
        /// Encoded frame.
        frame: Frame,
    },
}

/// Cloneable sending side of the hub queue.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Create the hub queue. The receiver goes to [`Hub::spawn`].
    pub fn channel() -> (Self, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Register a connection.
    pub async fn register(&self, handle: ConnectionHandle) {
        let _ = self.tx.send(HubCommand::Register(handle)).await;
    }

    /// Unregister a connection. Safe to call more than once.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Unregister(id)).await;
    }

    /// Queue a frame for every local connection.
    pub async fn broadcast(&self, frame: Frame) {
        let _ = self.tx.send(HubCommand::Broadcast(frame)).await;
    }

    /// Queue a frame for one user's local connection.
    pub async fn direct(&self, to: UserId, frame: Frame) {
        let _ = self.tx.send(HubCommand::Direct { to, frame }).await;
    }

    /// Non-blocking broadcast used from inside the hub's own call chain
    /// (fan-out local delivery) where awaiting queue space could deadlock.
    /// Returns false if the hub queue is full and the frame was dropped.
    pub fn try_broadcast(&self, frame: Frame) -> bool {
        self.tx.try_send(HubCommand::Broadcast(frame)).is_ok()
    }

    /// Non-blocking direct send; same contract as
    /// [`HubHandle::try_broadcast`].
    pub fn try_direct(&self, to: UserId, frame: Frame) -> bool {
        self.tx.try_send(HubCommand::Direct { to, frame }).is_ok()
    }
}

/// The coordinating loop. Owns the connection set; nothing else reads or
/// writes it.
pub struct Hub {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    presence: Arc<PresenceStore>,
    fanout: Arc<Fanout>,
}

impl Hub {
    /// Spawn the hub loop over `commands`.
    pub fn spawn(
        commands: mpsc::Receiver<HubCommand>,
        presence: Arc<PresenceStore>,
        fanout: Arc<Fanout>,
    ) -> JoinHandle<()> {
        let hub = Self {
            connections: HashMap::new(),
            presence,
            fanout,
        };
        tokio::spawn(hub.run(commands))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        info!("hub loop started");
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(handle) => self.register(handle).await,
                HubCommand::Unregister(id) => self.unregister(id).await,
                HubCommand::Broadcast(frame) => self.broadcast(frame).await,
                HubCommand::Direct { to, frame } => self.direct(to, frame).await,
            }
            gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
        }
        info!("hub loop stopped");
    }

    async fn register(&mut self, handle: ConnectionHandle) {
        let (user, username) = (handle.user, handle.username.clone());
        debug!(%user, connection = %handle.id, "connection registered");
        let _ = self.connections.insert(handle.id, handle);

        if user.is_valid() {
            self.presence.set_online(user).await;
            self.emit_status(user, &username, true).await;
        }
    }

    async fn unregister(&mut self, id: ConnectionId) {
        // dropping the handle closes the mailbox; the write pump observes
        // that and shuts the socket down
        let Some(handle) = self.connections.remove(&id) else {
            return; // already gone — unregister is idempotent
        };
        debug!(user = %handle.user, connection = %id, "connection unregistered");

        if handle.user.is_valid() {
            self.presence.set_offline(handle.user).await;
            self.emit_status(handle.user, &handle.username, false).await;
        }
    }

    async fn broadcast(&mut self, frame: Frame) {
        let mut evicted = Vec::new();
        for (id, conn) in &self.connections {
            if !conn.try_send(Arc::clone(&frame)) {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(user = %conn.user, connection = %id, "mailbox full, dropping slow consumer");
                evicted.push(*id);
            }
        }
        for id in evicted {
            self.unregister(id).await;
        }
    }

    async fn direct(&mut self, to: UserId, frame: Frame) {
        let Some(id) = self
            .connections
            .values()
            .find(|conn| conn.user == to)
            .map(|conn| conn.id)
        else {
            // recipient not on this instance; the frame is dropped here
            debug!(%to, "direct frame for user with no local connection");
            return;
        };
        let delivered = self
            .connections
            .get(&id)
            .is_some_and(|conn| conn.try_send(frame));
        if !delivered {
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            warn!(user = %to, connection = %id, "mailbox full, dropping slow consumer");
            self.unregister(id).await;
        }
    }

    async fn emit_status(&mut self, user: UserId, username: &str, online: bool) {
        let status = Envelope::user_status(user, username, online);
        self.fanout.broadcast_envelope(&status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_hub() -> HubHandle {
        let (handle, rx) = HubHandle::channel();
        let presence = Arc::new(PresenceStore::new(None));
        let fanout = Fanout::new(None, handle.clone());
        let _ = Hub::spawn(rx, presence, fanout);
        handle
    }

    async fn recv_until<F>(
        rx: &mut mpsc::Receiver<Frame>,
        mut pred: F,
    ) -> Option<Frame>
    where
        F: FnMut(&str) -> bool,
    {
        loop {
            match timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(frame)) if pred(&frame) => return Some(frame),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    }

    fn is_chat(frame: &str) -> bool {
        frame.contains(r#""type":"message""#)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_connection() {
        let hub = test_hub();
        let (a, mut a_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(1), "a");
        let (b, mut b_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(2), "b");
        hub.register(a).await;
        hub.register(b).await;

        let frame: Frame = Arc::from(r#"{"type":"message","text":"all"}"#);
        hub.broadcast(Arc::clone(&frame)).await;

        assert!(recv_until(&mut a_rx, is_chat).await.is_some());
        assert!(recv_until(&mut b_rx, is_chat).await.is_some());
    }

    #[tokio::test]
    async fn direct_send_reaches_only_the_recipient() {
        let hub = test_hub();
        let (a, mut a_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(1), "a");
        let (b, mut b_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(2), "b");
        hub.register(a).await;
        hub.register(b).await;

        hub.direct(UserId(2), Arc::from(r#"{"type":"message","text":"psst"}"#))
            .await;

        assert!(recv_until(&mut b_rx, is_chat).await.is_some());
        // a sees presence traffic but never the direct frame
        hub.broadcast(Arc::from(r#"{"type":"message","text":"flush"}"#))
            .await;
        let first_chat = recv_until(&mut a_rx, is_chat).await.unwrap();
        assert!(first_chat.contains("flush"));
    }

    #[tokio::test]
    async fn direct_send_to_absent_user_is_silently_dropped() {
        let hub = test_hub();
        let (a, mut a_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(1), "a");
        hub.register(a).await;

        hub.direct(UserId(42), Arc::from(r#"{"type":"message","text":"void"}"#))
            .await;
        hub.broadcast(Arc::from(r#"{"type":"message","text":"flush"}"#))
            .await;

        let first_chat = recv_until(&mut a_rx, is_chat).await.unwrap();
        assert!(first_chat.contains("flush"), "direct frame must not leak");
    }

    #[tokio::test]
    async fn full_mailbox_evicts_the_slow_consumer() {
        let hub = test_hub();
        let (slow, mut slow_rx) =
            ConnectionHandle::channel_with_capacity(ConnectionId::new(), UserId(1), "slow", 1);
        let (fast, mut fast_rx) = ConnectionHandle::channel(ConnectionId::new(), UserId(2), "fast");
        hub.register(slow).await;
        hub.register(fast).await;

        // the slow consumer never drains; its single slot fills on the
        // first delivered frame and whichever broadcast finds it full
        // evicts it
        hub.broadcast(Arc::from(r#"{"type":"message","text":"one"}"#))
            .await;
        hub.broadcast(Arc::from(r#"{"type":"message","text":"two"}"#))
            .await;

        // fast consumer sees both broadcasts and then the offline status
        // for the evicted user
        assert!(recv_until(&mut fast_rx, |f| f.contains("two")).await.is_some());
        assert!(recv_until(&mut fast_rx, |f| {
            f.contains(r#""type":"user_status""#) && f.contains(r#""is_online":false"#)
        })
        .await
        .is_some());

        // the evicted connection's mailbox is closed once drained
        while let Ok(Some(_)) = timeout(Duration::from_secs(2), slow_rx.recv()).await {}
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = test_hub();
        let id = ConnectionId::new();
        let (a, mut a_rx) = ConnectionHandle::channel(id, UserId(1), "a");
        let (watcher, mut watcher_rx) =
            ConnectionHandle::channel(ConnectionId::new(), UserId(2), "w");
        hub.register(a).await;
        hub.register(watcher).await;

        hub.unregister(id).await;
        hub.unregister(id).await;
        // let the hub drain the queue (status frames are re-enqueued at
        // the tail) before the sentinel broadcast
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.broadcast(Arc::from(r#"{"type":"message","text":"flush"}"#))
            .await;

        // exactly one offline status for user 1
        let mut offline_count = 0;
        while let Some(frame) = recv_until(&mut watcher_rx, |f| {
            f.contains("user_status") || f.contains("flush")
        })
        .await
        {
            if frame.contains("flush") {
                break;
            }
            if frame.contains(r#""user_id":1"#) && frame.contains(r#""is_online":false"#) {
                offline_count += 1;
            }
        }
        assert_eq!(offline_count, 1);
        assert!(a_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn register_marks_user_online_in_presence() {
        let (handle, rx) = HubHandle::channel();
        let presence = Arc::new(PresenceStore::new(None));
        let fanout = Fanout::new(None, handle.clone());
        let _ = Hub::spawn(rx, Arc::clone(&presence), fanout);

        let id = ConnectionId::new();
        let (a, _a_rx) = ConnectionHandle::channel(id, UserId(9), "a");
        handle.register(a).await;
        // flush the queue so the register is processed
        handle.broadcast(Arc::from("{}")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(presence.is_online(UserId(9)).await);

        handle.unregister(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!presence.is_online(UserId(9)).await);
    }
}
