//! Parser table, pending listeners and event fan-out for decoded envelopes.
//!
//! A dispatched envelope goes to the parser registered for its id (if any),
//! then to the event bus, then every pending listener is scanned in
//! registration order. All matches resolve; there is no consumption, so two
//! listeners for the same id can both see one envelope.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, error};

use steamcm_core::{CmError, CmResult, Envelope};

use crate::events::{Event, EventBus};

/// Handler invoked for every envelope of the id it is registered under.
pub type Handler<T> = Arc<dyn Fn(&Arc<T>) -> CmResult<()> + Send + Sync>;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Resolves when a matching message arrives. Dropping it cancels the wait;
/// the listener behind it is pruned on the next dispatch scan.
pub struct Waiter<T> {
    rx: oneshot::Receiver<Arc<T>>,
}

impl<T> Future for Waiter<T> {
    type Output = CmResult<Arc<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| CmError::Cancelled))
    }
}

struct Listener<K, T> {
    key: K,
    predicate: Predicate<T>,
    tx: oneshot::Sender<Arc<T>>,
}

/// Predicate-based one-shot listeners keyed by message id.
pub struct ListenerList<K, T> {
    entries: Mutex<Entries<K, T>>,
}

struct Entries<K, T> {
    listeners: Vec<Listener<K, T>>,
    /// Bumped by `clear` so a scan in flight does not restore dropped listeners.
    generation: u64,
}

impl<K, T> Default for ListenerList<K, T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                listeners: Vec::new(),
                generation: 0,
            }),
        }
    }
}

impl<K: PartialEq + Debug, T> ListenerList<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: K,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        self.lock().listeners.push(Listener {
            key,
            predicate: Box::new(predicate),
            tx,
        });
        Waiter { rx }
    }

    /// Resolve every live listener for `key` whose predicate accepts `item`,
    /// pruning resolved and cancelled ones. Returns the number resolved.
    ///
    /// Predicates run without the list locked, so they may register further
    /// listeners. A panicking predicate counts as a non-match.
    pub fn resolve(&self, key: &K, item: &Arc<T>) -> usize {
        let (taken, generation) = {
            let mut entries = self.lock();
            (std::mem::take(&mut entries.listeners), entries.generation)
        };
        let mut resolved = 0;
        let mut kept = Vec::with_capacity(taken.len());

        for listener in taken {
            if listener.tx.is_closed() {
                continue;
            }
            if listener.key != *key {
                kept.push(listener);
                continue;
            }
            let matched = catch_unwind(AssertUnwindSafe(|| (listener.predicate)(item)))
                .unwrap_or_else(|_| {
                    error!(key = ?listener.key, "listener predicate panicked");
                    false
                });
            if matched {
                if listener.tx.send(item.clone()).is_ok() {
                    resolved += 1;
                }
            } else {
                kept.push(listener);
            }
        }

        let mut entries = self.lock();
        if entries.generation == generation {
            // Listeners registered during the scan go after the survivors.
            kept.append(&mut entries.listeners);
            entries.listeners = kept;
        }
        resolved
    }

    /// Drop every listener; their waiters resolve to `Cancelled`.
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.listeners.clear();
        entries.generation += 1;
    }

    /// Listeners currently held, including cancelled ones not yet pruned.
    pub fn len(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries<K, T>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handler table keyed by message id.
pub struct ParserTable<K, T> {
    handlers: Mutex<HashMap<K, Handler<T>>>,
}

impl<K, T> Default for ParserTable<K, T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Debug, T: Debug> ParserTable<K, T> {
    /// Install `handler` for `key`, returning the one it replaces.
    pub fn register(
        &self,
        key: K,
        handler: impl Fn(&Arc<T>) -> CmResult<()> + Send + Sync + 'static,
    ) -> Option<Handler<T>> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(handler))
    }

    pub fn remove(&self, key: &K) -> Option<Handler<T>> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    /// Run the handler for `key`. Errors and panics are logged with the
    /// offending item and go no further. Returns whether a handler ran.
    pub fn run(&self, key: &K, item: &Arc<T>) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();
        let Some(handler) = handler else {
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(item))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(?key, error = %e, item = ?item, "parser failed"),
            Err(_) => error!(?key, item = ?item, "parser panicked"),
        }
        true
    }
}

/// Client-message dispatcher shared by the inbound pump and callers.
pub struct Dispatcher {
    parsers: ParserTable<u32, Envelope>,
    listeners: ListenerList<u32, Envelope>,
    events: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            parsers: ParserTable::default(),
            listeners: ListenerList::new(),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register the parser for `msg` (protobuf bit cleared).
    pub fn register_parser(
        &self,
        msg: impl Into<u32>,
        handler: impl Fn(&Arc<Envelope>) -> CmResult<()> + Send + Sync + 'static,
    ) -> Option<Handler<Envelope>> {
        self.parsers.register(msg.into(), handler)
    }

    pub fn remove_parser(&self, msg: impl Into<u32>) -> Option<Handler<Envelope>> {
        self.parsers.remove(&msg.into())
    }

    /// Wait for the next `msg` envelope accepted by `predicate`.
    pub fn wait_for(
        &self,
        msg: impl Into<u32>,
        predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static,
    ) -> Waiter<Envelope> {
        self.listeners.register(msg.into(), predicate)
    }

    /// Parser, then events, then listeners.
    pub fn dispatch(&self, envelope: Arc<Envelope>) {
        if !self.parsers.run(&envelope.msg, &envelope) {
            debug!(msg = envelope.msg, "no parser registered");
        }
        self.notify(envelope);
    }

    /// Events and listeners only, for messages the pump handles inline.
    pub fn notify(&self, envelope: Arc<Envelope>) {
        self.events.emit(&Event::message(envelope.clone()));
        self.listeners.resolve(&envelope.msg, &envelope);
    }

    /// Cancel every pending wait.
    pub fn cancel_all(&self) {
        self.listeners.clear();
    }

    pub fn pending(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use steamcm_core::protobufs::{CMsgClientHeartBeat, CMsgClientLogOff};
    use steamcm_core::EMsg;

    use crate::events::topics;

    fn heartbeat(job: u64) -> Arc<Envelope> {
        let mut env = Envelope::proto(EMsg::ClientHeartBeat, CMsgClientHeartBeat::default());
        env.header.set_job_id_target(job);
        Arc::new(env)
    }

    #[tokio::test]
    async fn only_matching_predicates_resolve() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let mut first = dispatcher.wait_for(EMsg::ClientHeartBeat, |e| e.job_id_target() == 1);
        let second = dispatcher.wait_for(EMsg::ClientHeartBeat, |e| e.job_id_target() == 2);

        dispatcher.dispatch(heartbeat(2));

        let got = second.await.unwrap();
        assert_eq!(got.job_id_target(), 2);
        assert!(futures_util::FutureExt::now_or_never(&mut first).is_none());
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test]
    async fn one_envelope_resolves_every_match() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let a = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        let b = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        dispatcher.dispatch(heartbeat(7));
        assert_eq!(a.await.unwrap().job_id_target(), 7);
        assert_eq!(b.await.unwrap().job_id_target(), 7);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn cancelled_listener_pruned_lazily() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let waiter = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        drop(waiter);
        assert_eq!(dispatcher.pending(), 1);

        dispatcher.dispatch(heartbeat(1));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn other_ids_are_left_alone() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let _waiter = dispatcher.wait_for(EMsg::ClientLoggedOff, |_| true);
        dispatcher.dispatch(heartbeat(1));
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test]
    async fn failing_parser_does_not_stop_dispatch() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        dispatcher.register_parser(EMsg::ClientHeartBeat, |_| {
            Err(CmError::Decode("bad".into()))
        });
        let waiter = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        dispatcher.dispatch(heartbeat(3));
        assert!(waiter.await.is_ok());

        dispatcher.register_parser(EMsg::ClientHeartBeat, |_| panic!("parser bug"));
        let waiter = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        dispatcher.dispatch(heartbeat(4));
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn panicking_predicate_is_a_non_match() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let _bad = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| panic!("predicate bug"));
        let good = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        dispatcher.dispatch(heartbeat(5));
        assert!(good.await.is_ok());
    }

    #[tokio::test]
    async fn predicate_may_register_a_follow_up_wait() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(EventBus::new())));
        let follow_ups = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&dispatcher);
        let slot = follow_ups.clone();
        let first = dispatcher.wait_for(EMsg::ClientHeartBeat, move |_| {
            if let Some(d) = weak.upgrade() {
                let next = d.wait_for(EMsg::ClientLogOff, |_| true);
                slot.lock().unwrap().push(next);
            }
            true
        });
        let unrelated = dispatcher.wait_for(EMsg::ClientLoggedOff, |_| true);

        dispatcher.dispatch(heartbeat(1));
        assert_eq!(first.await.unwrap().job_id_target(), 1);
        assert_eq!(dispatcher.pending(), 2);

        let next = follow_ups.lock().unwrap().pop().unwrap();
        dispatcher.dispatch(Arc::new(Envelope::proto(
            EMsg::ClientLogOff,
            CMsgClientLogOff {},
        )));
        assert!(next.await.is_ok());
        drop(unrelated);
    }

    #[tokio::test]
    async fn cancel_during_scan_keeps_nothing() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(EventBus::new())));
        let weak = Arc::downgrade(&dispatcher);
        let _trigger = dispatcher.wait_for(EMsg::ClientHeartBeat, move |_| {
            if let Some(d) = weak.upgrade() {
                d.cancel_all();
            }
            false
        });
        let later = dispatcher.wait_for(EMsg::ClientLoggedOff, |_| true);

        dispatcher.dispatch(heartbeat(1));
        assert_eq!(dispatcher.pending(), 0);
        assert!(matches!(later.await, Err(CmError::Cancelled)));
    }

    #[test]
    fn parser_and_event_both_fire() {
        let events = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        events.subscribe(topics::MESSAGE, move |e| {
            assert!(e.envelope.is_some());
            h.fetch_add(1, Ordering::SeqCst);
        });
        let dispatcher = Dispatcher::new(events);
        let h = hits.clone();
        dispatcher.register_parser(EMsg::ClientHeartBeat, move |_| {
            h.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.dispatch(heartbeat(1));
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters() {
        let dispatcher = Dispatcher::new(Arc::new(EventBus::new()));
        let waiter = dispatcher.wait_for(EMsg::ClientHeartBeat, |_| true);
        dispatcher.cancel_all();
        assert!(matches!(waiter.await, Err(CmError::Cancelled)));
    }
}
