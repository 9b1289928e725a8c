//! Fixed-capacity table of subscriber connections.
//!
//! The table has exactly `max_clients` slots. A registration first reserves
//! the lowest free slot, answers the subscriber, and only then binds the
//! connection into it, so two concurrent registrations never share a slot and
//! no slot is occupied before its subscriber heard "OK".
//!
//! Socket I/O never happens under the table lock. Callers take a snapshot of
//! [`SubscriberHandle`]s, release the lock, and write through the per-slot
//! stream mutex, which also keeps heartbeats and message frames from
//! interleaving on the wire.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::info;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Shared write side of a subscriber connection.
pub type SharedStream = Arc<Mutex<TcpStream>>;

/// A game server's log source, identified by its IP and UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    pub ip: IpAddr,
    pub port: u16,
}

impl Origin {
    /// IPv4-mapped IPv6 addresses are folded to plain IPv4 so a subscriber
    /// asking for `10.0.0.5` matches datagrams seen on a dual-stack socket.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: ip.to_canonical(),
            port,
        }
    }
}

impl From<SocketAddr> for Origin {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

/// A registered subscriber occupying a slot.
#[derive(Debug)]
pub struct Subscriber {
    /// Unique per binding; a reused slot gets a new id.
    pub id: u64,
    /// "ip:port" of the subscriber, used in log lines.
    pub peer: String,
    pub wanted: Origin,
    pub stream: SharedStream,
    /// Raised by the sender when a write to this subscriber failed.
    pub failed: Arc<AtomicBool>,
    pub connected_at: Instant,
}

/// Snapshot of an occupied slot, taken so I/O can run outside the lock.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    pub slot: usize,
    pub id: u64,
    pub peer: String,
    pub stream: SharedStream,
    failed: Arc<AtomicBool>,
}

impl SubscriberHandle {
    /// Marks the connection unusable. A failed or timed-out write may have
    /// left part of a frame on the wire, so nothing more is sent and the
    /// next liveness check evicts the slot.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Reserved,
    Occupied(Subscriber),
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    next_id: u64,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Empty).collect(),
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots. Reservations do not count.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the lowest-indexed empty slot, or `None` when the table is full.
    pub fn reserve(&mut self) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Empty))?;
        self.slots[index] = Slot::Reserved;
        Some(index)
    }

    /// Gives back a reservation that never got bound.
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Empty;
            }
        }
    }

    /// Binds a subscriber into a slot previously returned by [`reserve`].
    /// Returns the binding id, or `None` if `index` was not reserved.
    ///
    /// [`reserve`]: SlotTable::reserve
    pub fn occupy(
        &mut self,
        index: usize,
        peer: String,
        wanted: Origin,
        stream: SharedStream,
    ) -> Option<u64> {
        let slot = self.slots.get_mut(index)?;
        if !matches!(slot, Slot::Reserved) {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("Assigned client {} to slot {}", peer, index);
        *slot = Slot::Occupied(Subscriber {
            id,
            peer,
            wanted,
            stream,
            failed: Arc::new(AtomicBool::new(false)),
            connected_at: Instant::now(),
        });
        Some(id)
    }

    /// Whether any occupied slot wants datagrams from `origin`.
    pub fn is_wanted(&self, origin: &Origin) -> bool {
        self.subscribers().any(|(_, s)| s.wanted == *origin)
    }

    /// Every occupied slot whose subscriber wants `origin`.
    pub fn subscribers_for(&self, origin: &Origin) -> Vec<SubscriberHandle> {
        self.subscribers()
            .filter(|(_, s)| s.wanted == *origin)
            .map(|(index, s)| handle(index, s))
            .collect()
    }

    /// Every occupied slot.
    pub fn occupied(&self) -> Vec<SubscriberHandle> {
        self.subscribers()
            .map(|(index, s)| handle(index, s))
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&Subscriber> {
        match self.slots.get(index)? {
            Slot::Occupied(subscriber) => Some(subscriber),
            _ => None,
        }
    }

    /// Empties slot `index` if it still holds binding `id`. A slot that was
    /// already evicted and reused by someone else is left alone.
    pub fn evict(&mut self, index: usize, id: u64) -> Option<Subscriber> {
        let bound = matches!(self.slots.get(index)?, Slot::Occupied(s) if s.id == id);
        if !bound {
            return None;
        }
        match std::mem::replace(&mut self.slots[index], Slot::Empty) {
            Slot::Occupied(subscriber) => Some(subscriber),
            _ => None,
        }
    }

    /// Empties every slot, returning the subscribers that were bound.
    pub fn drain(&mut self) -> Vec<Subscriber> {
        self.slots
            .iter_mut()
            .filter_map(|slot| match std::mem::replace(slot, Slot::Empty) {
                Slot::Occupied(subscriber) => Some(subscriber),
                _ => None,
            })
            .collect()
    }

    fn subscribers(&self) -> impl Iterator<Item = (usize, &Subscriber)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(subscriber) => Some((index, subscriber)),
                _ => None,
            })
    }
}

fn handle(index: usize, subscriber: &Subscriber) -> SubscriberHandle {
    SubscriberHandle {
        slot: index,
        id: subscriber.id,
        peer: subscriber.peer.clone(),
        stream: Arc::clone(&subscriber.stream),
        failed: Arc::clone(&subscriber.failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn test_stream() -> SharedStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Arc::new(Mutex::new(client.unwrap()))
    }

    fn origin(port: u16) -> Origin {
        Origin::new("10.0.0.5".parse().unwrap(), port)
    }

    #[test]
    fn test_origin_folds_mapped_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.5]:27015".parse().unwrap();
        assert_eq!(Origin::from(mapped), origin(27015));
        assert_eq!(origin(27015).to_string(), "10.0.0.5:27015");
    }

    #[test]
    fn test_reserve_takes_lowest_free_slot() {
        let mut table = SlotTable::new(3);

        assert_eq!(table.reserve(), Some(0));
        assert_eq!(table.reserve(), Some(1));
        table.release(0);
        assert_eq!(table.reserve(), Some(0));
        assert_eq!(table.reserve(), Some(2));
        assert_eq!(table.reserve(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_zero_capacity_never_reserves() {
        let mut table = SlotTable::new(0);
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.reserve(), None);
    }

    #[tokio::test]
    async fn test_occupy_requires_reservation() {
        let mut table = SlotTable::new(2);
        let stream = test_stream().await;

        assert!(table
            .occupy(0, "1.2.3.4:5".into(), origin(1), Arc::clone(&stream))
            .is_none());

        let slot = table.reserve().unwrap();
        let id = table
            .occupy(slot, "1.2.3.4:5".into(), origin(1), stream)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(slot).unwrap().id, id);
    }

    #[tokio::test]
    async fn test_matching_by_origin() {
        let mut table = SlotTable::new(3);
        for (peer, port) in [("a:1", 27015), ("b:2", 27016), ("c:3", 27015)] {
            let slot = table.reserve().unwrap();
            table.occupy(slot, peer.into(), origin(port), test_stream().await);
        }

        let matched: Vec<usize> = table
            .subscribers_for(&origin(27015))
            .iter()
            .map(|h| h.slot)
            .collect();
        assert_eq!(matched, vec![0, 2]);
        assert!(table.is_wanted(&origin(27016)));
        assert!(!table.is_wanted(&origin(27017)));
        assert_eq!(table.occupied().len(), 3);
    }

    #[tokio::test]
    async fn test_evict_checks_binding_id() {
        let mut table = SlotTable::new(1);
        let slot = table.reserve().unwrap();
        let old = table
            .occupy(slot, "a:1".into(), origin(1), test_stream().await)
            .unwrap();

        assert!(table.evict(slot, old).is_some());
        assert!(table.evict(slot, old).is_none());

        let slot = table.reserve().unwrap();
        let new = table
            .occupy(slot, "b:2".into(), origin(1), test_stream().await)
            .unwrap();
        assert_ne!(old, new);
        assert!(table.evict(slot, old).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_mark_is_shared_between_handles() {
        let mut table = SlotTable::new(1);
        let slot = table.reserve().unwrap();
        table.occupy(slot, "a:1".into(), origin(1), test_stream().await);

        let first = table.subscribers_for(&origin(1)).remove(0);
        assert!(!first.has_failed());
        first.mark_failed();
        assert!(table.occupied()[0].has_failed());
    }

    #[tokio::test]
    async fn test_drain_empties_table() {
        let mut table = SlotTable::new(2);
        let slot = table.reserve().unwrap();
        table.occupy(slot, "a:1".into(), origin(1), test_stream().await);
        table.reserve();

        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.reserve(), Some(0));
    }
}
