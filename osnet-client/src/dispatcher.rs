//! Correlation of replies with outstanding requests.
//!
//! Every request sent on a connection gets a correlation id and a completion
//! channel. The dispatcher owns the table of pending completions: the receive
//! loop resolves them as replies arrive, connection teardown fails all of them,
//! and callers that stop waiting remove their own entry.

use crate::error::ClientError;
use osnet_protocol::Frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller.
pub type Completion = Result<Frame, ClientError>;

/// Pending requests above this count are logged as suspicious.
const PENDING_WARN_THRESHOLD: usize = 10_000;

/// Abandoned ids remembered at most; the oldest is forgotten first.
const ABANDONED_LIMIT: usize = 4096;

/// What [`Dispatcher::resolve`] did with a reply.
#[derive(Debug)]
pub enum Resolved {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller gave up on this request; the reply is returned for cleanup.
    Abandoned(Frame),
    /// No request was ever pending under this id, or it already completed.
    Unmatched,
}

impl Resolved {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Resolved::Delivered)
    }
}

struct PendingRequest {
    issued_at: Instant,
    completion: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u32, PendingRequest>,
    /// Requests whose caller stopped waiting, by time of abandonment.
    abandoned: HashMap<u32, Instant>,
    closed: bool,
}

/// Table of pending requests keyed by correlation id.
pub struct Dispatcher {
    table: Mutex<PendingTable>,
    next_id: AtomicU32,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Returns the next correlation id.
    ///
    /// The counter wraps around; 0 and ids that are still pending are skipped.
    pub fn next_correlation_id(&self) -> u32 {
        let table = self.table.lock();
        self.allocate_id(&table)
    }

    fn allocate_id(&self, table: &PendingTable) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !table.entries.contains_key(&id) && !table.abandoned.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a pending request under `correlation_id`.
    pub fn register(&self, correlation_id: u32) -> Result<oneshot::Receiver<Completion>, ClientError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(ClientError::ConnectionClosed);
        }
        if table.entries.contains_key(&correlation_id) {
            return Err(ClientError::DuplicateCorrelation(correlation_id));
        }
        table.abandoned.remove(&correlation_id);
        Ok(Self::insert(&mut table, correlation_id))
    }

    /// Allocates a fresh correlation id and registers it in one step.
    pub fn register_next(&self) -> Result<(u32, oneshot::Receiver<Completion>), ClientError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(ClientError::ConnectionClosed);
        }
        let id = self.allocate_id(&table);
        Ok((id, Self::insert(&mut table, id)))
    }

    fn insert(table: &mut PendingTable, correlation_id: u32) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            correlation_id,
            PendingRequest {
                issued_at: Instant::now(),
                completion: tx,
            },
        );

        let pending = table.entries.len();
        if pending > PENDING_WARN_THRESHOLD {
            tracing::warn!(pending, "unusually many pending requests");
        }
        rx
    }

    /// Completes the request with `reply`.
    ///
    /// A reply for an abandoned request is handed back so the caller can undo
    /// its side effects. Anything else without a pending request is logged and
    /// dropped.
    pub fn resolve(&self, correlation_id: u32, reply: Frame) -> Resolved {
        let entry = {
            let mut table = self.table.lock();
            match table.entries.remove(&correlation_id) {
                Some(pending) => Some(pending),
                None if table.abandoned.remove(&correlation_id).is_some() => {
                    tracing::debug!(
                        correlation_id,
                        msg_type = %reply.msg_type,
                        "late reply for abandoned request"
                    );
                    return Resolved::Abandoned(reply);
                }
                None => None,
            }
        };

        match entry {
            Some(pending) => {
                if pending.completion.send(Ok(reply)).is_err() {
                    tracing::debug!(correlation_id, "caller stopped waiting before reply");
                }
                Resolved::Delivered
            }
            None => {
                tracing::warn!(
                    correlation_id,
                    msg_type = %reply.msg_type,
                    "dropping reply with no pending request"
                );
                Resolved::Unmatched
            }
        }
    }

    /// Completes the request with an error. Same contract as [`resolve`](Self::resolve).
    pub fn fail(&self, correlation_id: u32, error: ClientError) -> bool {
        let entry = self.table.lock().entries.remove(&correlation_id);
        match entry {
            Some(pending) => {
                let _ = pending.completion.send(Err(error));
                true
            }
            None => {
                tracing::debug!(correlation_id, %error, "no pending request to fail");
                false
            }
        }
    }

    /// Fails every pending request and rejects later registrations.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, reason: impl Fn() -> ClientError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.abandoned.clear();
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.completion.send(Err(reason()));
        }
        count
    }

    /// Removes a request without completing it.
    ///
    /// The id stays reserved until its late reply arrives or it expires, and
    /// that reply is returned by [`resolve`](Self::resolve) as
    /// [`Resolved::Abandoned`].
    pub fn abandon(&self, correlation_id: u32) -> bool {
        let mut table = self.table.lock();
        if table.entries.remove(&correlation_id).is_none() {
            return false;
        }
        if !table.closed {
            if table.abandoned.len() >= ABANDONED_LIMIT {
                let oldest = table
                    .abandoned
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(id, _)| *id);
                if let Some(oldest) = oldest {
                    table.abandoned.remove(&oldest);
                }
            }
            table.abandoned.insert(correlation_id, Instant::now());
        }
        true
    }

    /// Returns the number of abandoned requests still awaiting a late reply.
    pub fn abandoned_count(&self) -> usize {
        self.table.lock().abandoned.len()
    }

    /// Fails requests that have been pending longer than `max_age` with `Timeout`.
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<_> = {
            let mut table = self.table.lock();
            table.abandoned.retain(|_, at| at.elapsed() < max_age);
            let ids: Vec<u32> = table
                .entries
                .iter()
                .filter(|(_, p)| p.issued_at.elapsed() >= max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.entries.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, pending) in expired {
            tracing::debug!(correlation_id = id, "evicting expired request");
            let _ = pending.completion.send(Err(ClientError::Timeout));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Returns pending correlation ids in ascending order.
    pub fn pending_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns whether [`fail_all`](Self::fail_all) has been called.
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use osnet_protocol::MessageType;
    use std::sync::Arc;

    fn reply(id: u32, body: &'static [u8]) -> Frame {
        Frame::reply(MessageType::Ping, id, Bytes::from_static(body))
    }

    #[test]
    fn test_resolve_fires_once() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.register(7).unwrap();

        assert!(dispatcher.resolve(7, reply(7, b"first")).is_delivered());
        assert!(matches!(
            dispatcher.resolve(7, reply(7, b"second")),
            Resolved::Unmatched
        ));

        let frame = rx.try_recv().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"first");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_registration() {
        let dispatcher = Dispatcher::new();
        let _rx = dispatcher.register(3).unwrap();
        assert!(matches!(
            dispatcher.register(3),
            Err(ClientError::DuplicateCorrelation(3))
        ));
    }

    #[test]
    fn test_id_reusable_after_resolution() {
        let dispatcher = Dispatcher::new();
        let _rx = dispatcher.register(3).unwrap();
        dispatcher.resolve(3, reply(3, b""));
        assert!(dispatcher.register(3).is_ok());
    }

    #[test]
    fn test_unknown_reply_is_dropped() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.resolve(99, reply(99, b"late")),
            Resolved::Unmatched
        ));
        assert!(!dispatcher.fail(99, ClientError::Timeout));
    }

    #[test]
    fn test_out_of_order_resolution() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = dispatcher.register(1).unwrap();
        let mut rx2 = dispatcher.register(2).unwrap();

        dispatcher.resolve(2, reply(2, b"two"));
        dispatcher.resolve(1, reply(1, b"one"));

        assert_eq!(&rx1.try_recv().unwrap().unwrap().payload[..], b"one");
        assert_eq!(&rx2.try_recv().unwrap().unwrap().payload[..], b"two");
    }

    #[test]
    fn test_fail_delivers_error() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.register(5).unwrap();
        assert!(dispatcher.fail(5, ClientError::StreamClosed));
        assert!(matches!(rx.try_recv().unwrap(), Err(ClientError::StreamClosed)));
    }

    #[test]
    fn test_fail_all_closes_dispatcher() {
        let dispatcher = Dispatcher::new();
        let receivers: Vec<_> = (1..=3).map(|id| dispatcher.register(id).unwrap()).collect();

        assert_eq!(dispatcher.fail_all(|| ClientError::ConnectionClosed), 3);
        for mut rx in receivers {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
        }

        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.register(10),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            dispatcher.register_next(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_abandon_then_late_reply() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.register(4).unwrap();

        assert!(dispatcher.abandon(4));
        assert!(!dispatcher.abandon(4));
        assert_eq!(dispatcher.abandoned_count(), 1);

        match dispatcher.resolve(4, reply(4, b"late")) {
            Resolved::Abandoned(frame) => assert_eq!(&frame.payload[..], b"late"),
            other => panic!("expected abandoned reply, got {:?}", other),
        }
        // Handed back once only
        assert!(matches!(
            dispatcher.resolve(4, reply(4, b"again")),
            Resolved::Unmatched
        ));
        assert_eq!(dispatcher.abandoned_count(), 0);

        // Sender dropped without firing
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_abandoned_ids_are_not_reused() {
        let dispatcher = Dispatcher::new();
        let (id, _rx) = dispatcher.register_next().unwrap();
        dispatcher.abandon(id);

        dispatcher.next_id.store(id, Ordering::Relaxed);
        assert_ne!(dispatcher.next_correlation_id(), id);
    }

    #[test]
    fn test_abandoned_ids_expire() {
        let dispatcher = Dispatcher::new();
        let _rx = dispatcher.register(8).unwrap();
        dispatcher.abandon(8);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(dispatcher.evict_expired(Duration::from_millis(20)), 0);
        assert_eq!(dispatcher.abandoned_count(), 0);
        assert!(matches!(
            dispatcher.resolve(8, reply(8, b"")),
            Resolved::Unmatched
        ));
    }

    #[test]
    fn test_next_id_skips_zero_and_pending() {
        let dispatcher = Dispatcher::new();
        dispatcher.next_id.store(u32::MAX, Ordering::Relaxed);
        let _rx = dispatcher.register(1).unwrap();

        assert_eq!(dispatcher.next_correlation_id(), u32::MAX);
        // Wraps to 0 (skipped) then 1 (pending, skipped)
        assert_eq!(dispatcher.next_correlation_id(), 2);
    }

    #[test]
    fn test_register_next_unique() {
        let dispatcher = Dispatcher::new();
        let (a, _rx_a) = dispatcher.register_next().unwrap();
        let (b, _rx_b) = dispatcher.register_next().unwrap();
        assert_ne!(a, b);
        assert_eq!(dispatcher.pending_ids(), {
            let mut ids = vec![a, b];
            ids.sort_unstable();
            ids
        });
    }

    #[test]
    fn test_evict_expired() {
        let dispatcher = Dispatcher::new();
        let mut old = dispatcher.register(1).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let mut fresh = dispatcher.register(2).unwrap();

        assert_eq!(dispatcher.evict_expired(Duration::from_millis(20)), 1);
        assert!(matches!(old.try_recv().unwrap(), Err(ClientError::Timeout)));
        assert!(fresh.try_recv().is_err());
        assert_eq!(dispatcher.pending_ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_get_their_own_reply() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut waiters = Vec::new();
        for _ in 0..32 {
            let (id, rx) = dispatcher.register_next().unwrap();
            waiters.push(tokio::spawn(async move {
                let frame = rx.await.unwrap().unwrap();
                (id, frame.payload)
            }));
        }

        // Resolve in reverse order of issue
        let mut ids = dispatcher.pending_ids();
        ids.reverse();
        for id in ids {
            let body = Bytes::from(id.to_be_bytes().to_vec());
            assert!(dispatcher
                .resolve(id, Frame::reply(MessageType::Ping, id, body))
                .is_delivered());
        }

        for waiter in waiters {
            let (id, payload) = waiter.await.unwrap();
            assert_eq!(&payload[..], &id.to_be_bytes());
        }
    }
}
