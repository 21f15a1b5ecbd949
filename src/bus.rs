//! In-process message bus: named groups of subscriber channels plus a set
//! of named expiring locks. One instance per process; everything that fans
//! out across connections goes through here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::messages::ServerMessage;

pub type ChannelId = u64;

/// What a connection task can receive over its bus channel.
#[derive(Clone, Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: String },
}

pub type BusSender = mpsc::Sender<Outbound>;
pub type BusReceiver = mpsc::Receiver<Outbound>;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Default)]
struct Membership {
    channels: HashMap<ChannelId, BusSender>,
    groups: HashMap<String, HashSet<ChannelId>>,
}

#[derive(Default)]
pub struct Bus {
    next_id: AtomicU64,
    membership: Mutex<Membership>,
    locks: Mutex<HashMap<String, Instant>>,
}

impl Bus {
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Allocate a channel for a connection task. The task owns the receiver;
    /// the bus keeps the sender until `unregister`.
    pub fn register(&self) -> (ChannelId, BusReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut m = self.membership.lock().unwrap();
        m.channels.insert(id, tx);
        (id, rx)
    }

    /// Drop a channel and every group membership it holds.
    pub fn unregister(&self, id: ChannelId) {
        let mut m = self.membership.lock().unwrap();
        m.channels.remove(&id);
        m.groups.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    pub fn group_add(&self, group: &str, id: ChannelId) {
        let mut m = self.membership.lock().unwrap();
        m.groups.entry(group.to_string()).or_default().insert(id);
    }

    pub fn group_discard(&self, group: &str, id: ChannelId) {
        let mut m = self.membership.lock().unwrap();
        if let Some(members) = m.groups.get_mut(group) {
            members.remove(&id);
            if members.is_empty() {
                m.groups.remove(group);
            }
        }
    }

    /// Deliver a message to every member of a group. Channels whose receiver
    /// is gone are skipped; they get cleaned up on unregister.
    pub async fn group_send(&self, group: &str, message: Outbound) {
        let targets: Vec<BusSender> = {
            let m = self.membership.lock().unwrap();
            match m.groups.get(group) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| m.channels.get(id).cloned())
                    .collect(),
                None => return,
            }
        };

        for tx in targets {
            let _ = tx.send(message.clone()).await;
        }
    }

    pub async fn group_frame(&self, group: &str, frame: ServerMessage) {
        self.group_send(group, Outbound::Frame(frame)).await;
    }

    pub async fn send_to_channel(&self, id: ChannelId, message: Outbound) {
        let tx = {
            let m = self.membership.lock().unwrap();
            m.channels.get(&id).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(message).await;
        }
    }

    /// Acquire a named lock if it is free or its previous holder's lease has
    /// expired. The in-process analogue of a short-lived named key with an
    /// expiry in a shared bus.
    pub fn try_acquire(&self, name: &str, ttl: Duration) -> bool {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        match locks.get(name) {
            Some(expires) if *expires > now => false,
            _ => {
                locks.insert(name.to_string(), now + ttl);
                true
            }
        }
    }

    pub fn release(&self, name: &str) {
        self.locks.lock().unwrap().remove(name);
    }
}

/// Personal group of a user, joined by their matchmaking and invitation
/// sockets for direct notifications.
pub fn user_group(user_id: i64) -> String {
    format!("user_{user_id}")
}

/// Group shared by both sockets of one game room.
pub fn game_group(game_id: i64) -> String {
    format!("game_{game_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_send_reaches_members_only() {
        let bus = Bus::new();
        let (a, mut rx_a) = bus.register();
        let (_b, mut rx_b) = bus.register();

        bus.group_add("room", a);
        bus.group_frame("room", ServerMessage::Pong).await;

        assert!(matches!(
            rx_a.recv().await,
            Some(Outbound::Frame(ServerMessage::Pong))
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn discard_stops_delivery() {
        let bus = Bus::new();
        let (a, mut rx_a) = bus.register();
        bus.group_add("room", a);
        bus.group_discard("room", a);
        bus.group_frame("room", ServerMessage::Pong).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_from_groups() {
        let bus = Bus::new();
        let (a, _rx) = bus.register();
        bus.group_add("room", a);
        bus.unregister(a);
        // no receiver left; must not panic or deliver
        bus.group_frame("room", ServerMessage::Pong).await;
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let bus = Bus::new();
        assert!(bus.try_acquire("pairing", Duration::from_secs(10)));
        assert!(!bus.try_acquire("pairing", Duration::from_secs(10)));
        bus.release("pairing");
        assert!(bus.try_acquire("pairing", Duration::from_secs(10)));
    }

    #[test]
    fn lock_lease_expires() {
        let bus = Bus::new();
        assert!(bus.try_acquire("pairing", Duration::from_millis(0)));
        // zero ttl: the lease is already stale
        assert!(bus.try_acquire("pairing", Duration::from_secs(10)));
    }
}
