//! Connection registry and broadcast fan-out
//!
//! Tracks upgraded connections partitioned into role sets and delivers
//! encoded frames to every member of a set. Thread-safe: register,
//! unregister and the prune step of a broadcast all take the same write lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionId, Role};
use crate::codec::create_frame;

/// Number of characters of a broadcast shown in debug logs
const PREVIEW_CHARS: usize = 50;

/// Members of one role
type RoleSet = HashMap<ConnectionId, Arc<Connection>>;

/// The two broadcast targets
#[derive(Default)]
struct RoleSets {
    chat: RoleSet,
    observers: RoleSet,
}

impl RoleSets {
    fn get(&self, role: Role) -> Option<&RoleSet> {
        match role {
            Role::Chat => Some(&self.chat),
            Role::Observer => Some(&self.observers),
            Role::Unclassified => None,
        }
    }

    fn get_mut(&mut self, role: Role) -> Option<&mut RoleSet> {
        match role {
            Role::Chat => Some(&mut self.chat),
            Role::Observer => Some(&mut self.observers),
            Role::Unclassified => None,
        }
    }

    /// Remove `id` from every set, returning the role it held
    fn remove(&mut self, id: &ConnectionId) -> Role {
        let mut role = Role::Unclassified;
        if self.chat.remove(id).is_some() {
            role = Role::Chat;
        }
        if self.observers.remove(id).is_some() {
            role = Role::Observer;
        }
        role
    }
}

/// Outcome of a broadcast pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that received the frame
    pub delivered: usize,
    /// Connections removed because the send failed
    pub pruned: Vec<ConnectionId>,
}

/// Registry of chat participants and observers
#[derive(Default)]
pub struct ConnectionRegistry {
    sets: RwLock<RoleSets>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the set for `role`
    ///
    /// Idempotent. A connection registered under the other role is moved so it
    /// never sits in both sets. Registering as [`Role::Unclassified`] removes
    /// it. Returns `false` if the connection is already closed and was not
    /// added.
    pub async fn register(&self, conn: &Arc<Connection>, role: Role) -> bool {
        let mut sets = self.sets.write().await;

        if conn.is_closed() {
            sets.remove(&conn.id());
            return false;
        }

        let previous = sets.remove(&conn.id());
        if let Some(set) = sets.get_mut(role) {
            set.insert(conn.id(), Arc::clone(conn));
        }

        if previous != role {
            info!(
                "Connection {} ({}) registered as {}",
                conn.id(),
                conn.peer_addr(),
                role
            );
        }
        true
    }

    /// Remove a connection from whichever set holds it
    ///
    /// Idempotent; returns the role the connection held.
    pub async fn unregister(&self, id: ConnectionId) -> Role {
        let role = self.sets.write().await.remove(&id);
        if role != Role::Unclassified {
            debug!("Connection {} unregistered from {}", id, role);
        }
        role
    }

    /// Role currently recorded for a connection
    #[cfg(test)]
    pub async fn role_of(&self, id: ConnectionId) -> Role {
        let sets = self.sets.read().await;
        if sets.chat.contains_key(&id) {
            Role::Chat
        } else if sets.observers.contains_key(&id) {
            Role::Observer
        } else {
            Role::Unclassified
        }
    }

    /// Number of connections registered under `role`
    pub async fn count(&self, role: Role) -> usize {
        self.sets.read().await.get(role).map_or(0, HashMap::len)
    }

    /// Encode `message` once and send it to every member of `role`
    ///
    /// Members are snapshotted under the read lock and written concurrently,
    /// so one slow or dead socket does not hold up the others. Every member
    /// whose send fails is removed in a single write-locked pass afterwards;
    /// the failed connection is already marked closed and will not be written
    /// to again.
    pub async fn broadcast(&self, role: Role, message: &str) -> BroadcastReport {
        let targets: Vec<Arc<Connection>> = {
            let sets = self.sets.read().await;
            match sets.get(role) {
                Some(set) => set.values().cloned().collect(),
                None => return BroadcastReport::default(),
            }
        };

        if targets.is_empty() {
            return BroadcastReport::default();
        }

        debug!(
            "Broadcasting to {} {} connection(s): {}",
            targets.len(),
            role,
            preview(message)
        );

        let frame = create_frame(message);
        let results = join_all(targets.iter().map(|conn| {
            let frame = &frame;
            async move { (conn, conn.send_raw(frame).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (conn, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Send to {} ({}) failed, removing from {}: {}",
                        conn.id(),
                        conn.peer_addr(),
                        role,
                        e
                    );
                    report.pruned.push(conn.id());
                }
            }
        }

        if !report.pruned.is_empty() {
            let mut sets = self.sets.write().await;
            for id in &report.pruned {
                sets.remove(id);
            }
        }

        report
    }
}

fn preview(message: &str) -> &str {
    match message.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_frame;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn connection() -> (Arc<Connection>, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        (Arc::new(Connection::new(addr(), client)), server)
    }

    async fn recv_text(peer: &mut DuplexStream) -> String {
        timeout(Duration::from_secs(2), read_frame(peer))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .into_text()
            .unwrap()
    }

    async fn assert_silent(peer: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(result.is_err(), "peer unexpectedly received data");
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = connection();

        assert!(registry.register(&conn, Role::Chat).await);
        assert!(registry.register(&conn, Role::Chat).await);
        assert_eq!(registry.count(Role::Chat).await, 1);
        assert_eq!(registry.role_of(conn.id()).await, Role::Chat);
    }

    #[tokio::test]
    async fn test_register_moves_between_roles() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = connection();

        registry.register(&conn, Role::Observer).await;
        registry.register(&conn, Role::Chat).await;

        assert_eq!(registry.count(Role::Observer).await, 0);
        assert_eq!(registry.count(Role::Chat).await, 1);
        assert_eq!(registry.role_of(conn.id()).await, Role::Chat);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = connection();

        registry.register(&conn, Role::Observer).await;
        assert_eq!(registry.unregister(conn.id()).await, Role::Observer);
        assert_eq!(registry.unregister(conn.id()).await, Role::Unclassified);
        assert_eq!(registry.count(Role::Observer).await, 0);
    }

    #[tokio::test]
    async fn test_closed_connection_not_registered() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = connection();

        conn.close().await;
        assert!(!registry.register(&conn, Role::Chat).await);
        assert_eq!(registry.count(Role::Chat).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_respects_roles() {
        let registry = ConnectionRegistry::new();
        let (chat, mut chat_peer) = connection();
        let (observer, mut observer_peer) = connection();

        registry.register(&chat, Role::Chat).await;
        registry.register(&observer, Role::Observer).await;

        let report = registry.broadcast(Role::Observer, "for observers").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_text(&mut observer_peer).await, "for observers");
        assert_silent(&mut chat_peer).await;

        let report = registry.broadcast(Role::Chat, "for chat").await;
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_text(&mut chat_peer).await, "for chat");
        assert_silent(&mut observer_peer).await;
    }

    #[tokio::test]
    async fn test_broadcast_prunes_failed_connections() {
        let registry = ConnectionRegistry::new();
        let (alive, mut alive_peer) = connection();
        let (dead, dead_peer) = connection();
        let (other, mut other_peer) = connection();

        registry.register(&alive, Role::Chat).await;
        registry.register(&dead, Role::Chat).await;
        registry.register(&other, Role::Chat).await;
        drop(dead_peer);

        let report = registry.broadcast(Role::Chat, "first").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![dead.id()]);
        assert_eq!(registry.count(Role::Chat).await, 2);
        assert_eq!(registry.role_of(dead.id()).await, Role::Unclassified);
        assert!(dead.is_closed());

        let report = registry.broadcast(Role::Chat, "second").await;
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());

        assert_eq!(recv_text(&mut alive_peer).await, "first");
        assert_eq!(recv_text(&mut alive_peer).await, "second");
        assert_eq!(recv_text(&mut other_peer).await, "first");
        assert_eq!(recv_text(&mut other_peer).await, "second");
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_or_unclassified() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.broadcast(Role::Chat, "nobody").await,
            BroadcastReport::default()
        );
        assert_eq!(
            registry.broadcast(Role::Unclassified, "nobody").await,
            BroadcastReport::default()
        );
    }

    #[tokio::test]
    async fn test_concurrent_broadcast_and_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut peers = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..16 {
            let (conn, peer) = connection();
            registry.register(&conn, Role::Chat).await;
            conns.push(conn);
            peers.push(peer);
        }

        // Drop half of the peers so their sends fail while others unregister.
        let dropped: Vec<_> = peers.drain(..8).collect();
        drop(dropped);

        let mut tasks = Vec::new();
        for i in 0..4 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.broadcast(Role::Chat, &format!("msg {}", i)).await
            }));
        }
        for conn in conns.iter().take(8) {
            let registry = Arc::clone(&registry);
            let id = conn.id();
            tasks.push(tokio::spawn(async move {
                registry.unregister(id).await;
                BroadcastReport::default()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.count(Role::Chat).await, 8);
        for conn in conns.iter().take(8) {
            assert_eq!(registry.role_of(conn.id()).await, Role::Unclassified);
        }
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(80);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }
}
