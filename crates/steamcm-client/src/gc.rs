//! Game Coordinator sub-dispatcher.
//!
//! Sits on a [`Gateway`] as the parser for `ClientFromGC`. Each tunneled
//! message is unwrapped with the [`GcRegistry`], then routed through an
//! `{app_id: {msg: handler}}` table and the GC listener list. Every lookup
//! carries the app id explicitly since GC message ids overlap between apps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use prost::Message;
use tracing::{debug, warn};

use steamcm_core::protobufs::CMsgGcClient;
use steamcm_core::{CmError, CmResult, EMsg, Envelope, GcEnvelope, GcRegistry, Header};

use crate::dispatch::{Handler, ListenerList, ParserTable, Waiter};
use crate::events::Event;
use crate::gateway::Gateway;

struct GcInner {
    gateway: Gateway,
    registry: RwLock<GcRegistry>,
    handlers: Mutex<HashMap<u32, Arc<ParserTable<u32, GcEnvelope>>>>,
    listeners: ListenerList<(u32, u32), GcEnvelope>,
}

/// GC routing for one gateway. Cheap to clone.
#[derive(Clone)]
pub struct GcDispatcher {
    inner: Arc<GcInner>,
}

impl GcDispatcher {
    /// Attach to `gateway`, replacing any `ClientFromGC` parser it had.
    pub fn new(gateway: Gateway, registry: GcRegistry) -> Self {
        let inner = Arc::new(GcInner {
            gateway: gateway.clone(),
            registry: RwLock::new(registry),
            handlers: Mutex::new(HashMap::new()),
            listeners: ListenerList::new(),
        });

        let weak: Weak<GcInner> = Arc::downgrade(&inner);
        gateway.register_parser(EMsg::ClientFromGC, move |outer| {
            if let Some(inner) = weak.upgrade() {
                GcDispatcher { inner }.handle(outer);
            }
            Ok(())
        });

        Self { inner }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    /// Register the body type of `msg` for `app_id`.
    pub fn register_message<T>(&self, app_id: u32, msg: u32)
    where
        T: Message + Default + Send + Sync + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register::<T>(app_id, msg);
    }

    /// Whether a body type is registered for `msg` within `app_id`.
    pub fn has_message(&self, app_id: u32, msg: u32) -> bool {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(app_id, msg)
    }

    /// Install the handler for `msg` within `app_id`.
    pub fn register_handler(
        &self,
        app_id: u32,
        msg: u32,
        handler: impl Fn(&Arc<GcEnvelope>) -> CmResult<()> + Send + Sync + 'static,
    ) -> Option<Handler<GcEnvelope>> {
        if !self.has_message(app_id, msg) {
            warn!(app_id, msg, "GC handler registered for a message with no decoder");
        }
        let table = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(app_id)
            .or_default()
            .clone();
        table.register(msg, handler)
    }

    /// Unwrap the GC message carried by a `ClientFromGC` envelope. Anything
    /// that cannot be decoded is logged and dropped.
    pub fn parse_gc_message(&self, outer: &Envelope) -> Option<GcEnvelope> {
        let Some(body) = outer.body::<CMsgGcClient>() else {
            warn!(msg = outer.msg, "GC tunnel message without a body");
            return None;
        };

        let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        match GcEnvelope::parse(body, &registry) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!(
                    app_id = body.appid.unwrap_or_default(),
                    msgtype = body.msgtype.unwrap_or_default(),
                    error = %e,
                    "dropping GC message"
                );
                None
            }
        }
    }

    fn handle(&self, outer: &Envelope) {
        let Some(envelope) = self.parse_gc_message(outer) else {
            return;
        };
        let envelope = Arc::new(envelope);
        let (app_id, msg) = (envelope.app_id, envelope.msg);

        let table = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&app_id)
            .cloned();
        let handled = table.is_some_and(|t| t.run(&msg, &envelope));
        if !handled {
            debug!(app_id, msg, "no GC handler registered");
        }

        self.inner
            .gateway
            .events()
            .emit(&Event::gc_message(envelope.clone()));
        self.inner.listeners.resolve(&(app_id, msg), &envelope);
    }

    /// Resolves with the next GC message `msg` from `app_id` accepted by
    /// `predicate`.
    pub fn gc_wait_for(
        &self,
        app_id: u32,
        msg: u32,
        predicate: impl Fn(&GcEnvelope) -> bool + Send + Sync + 'static,
    ) -> Waiter<GcEnvelope> {
        self.inner
            .listeners
            .register((app_id, steamcm_core::clear_proto_bit(msg)), predicate)
    }

    /// Tunnel `envelope` to its app's coordinator.
    pub async fn send(&self, envelope: &GcEnvelope) -> CmResult<()> {
        let mut outer = Envelope::proto(EMsg::ClientToGC, envelope.to_gc_client());
        if let Header::Proto(h) = &mut outer.header {
            h.proto.routing_appid = Some(envelope.app_id);
        }
        self.inner.gateway.send(outer).await
    }

    /// Send a protobuf GC message.
    pub async fn send_proto<T: Message>(&self, app_id: u32, msg: u32, body: &T) -> CmResult<()> {
        self.send(&GcEnvelope::proto(app_id, msg, body)).await
    }

    /// Send a protobuf GC message and wait for `response_msg` answering its
    /// job id.
    pub async fn call<T: Message>(
        &self,
        app_id: u32,
        msg: u32,
        body: &T,
        response_msg: u32,
    ) -> CmResult<Arc<GcEnvelope>> {
        let job = self.inner.gateway.next_job_id();
        let mut envelope = GcEnvelope::proto(app_id, msg, body);
        envelope.header.set_job_id_source(job);

        let response = self.gc_wait_for(app_id, response_msg, move |e| e.job_id_target() == job);
        self.send(&envelope).await?;

        tokio::time::timeout(self.inner.gateway.config().request_timeout(), response)
            .await
            .map_err(|_| CmError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use steamcm_core::protobufs::gc::{
        CMsgClientHello, CMsgClientWelcome, EMSG_GC_CLIENT_HELLO, EMSG_GC_CLIENT_WELCOME,
    };
    use steamcm_core::SteamId;

    use crate::config::ClientConfig;
    use crate::credentials::StaticCredentials;
    use crate::events::{topics, EventBus};
    use crate::gateway::ConnectOptions;
    use crate::servers::tests::MockDirectory;
    use crate::servers::ServerList;
    use crate::transport::memory::{self, MemoryConnector, MemoryPeer};

    const TF2: u32 = 440;
    const CSGO: u32 = 730;

    fn gateway() -> (Gateway, MemoryPeer) {
        let (transport, peer) = memory::pair();
        let options = ConnectOptions {
            config: ClientConfig::default(),
            credentials: Arc::new(StaticCredentials::new("u", SteamId::individual(1), "t")),
            servers: Arc::new(ServerList::new(Arc::new(MockDirectory::ok(&[])), 0, 10)),
            connector: Arc::new(MemoryConnector::new()),
            events: Arc::new(EventBus::new()),
        };
        (Gateway::from_transport("mem:1".into(), transport, &options), peer)
    }

    fn from_gc(app_id: u32, version: u32) -> Envelope {
        let gc = GcEnvelope::proto(
            app_id,
            EMSG_GC_CLIENT_WELCOME,
            &CMsgClientWelcome {
                version: Some(version),
                game_data: None,
            },
        );
        Envelope::proto(EMsg::ClientFromGC, gc.to_gc_client())
    }

    #[tokio::test]
    async fn handlers_partitioned_by_app() {
        let (gateway, peer) = gateway();
        let mut registry = GcRegistry::with_base_messages(TF2);
        registry.register_base_messages(CSGO);
        let gc = GcDispatcher::new(gateway, registry);

        let seen: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        for app in [TF2, CSGO] {
            let s = seen.clone();
            gc.register_handler(app, EMSG_GC_CLIENT_WELCOME, move |e| {
                let version = e.body::<CMsgClientWelcome>().and_then(|b| b.version).unwrap_or(0);
                assert_eq!(e.app_id, app);
                s.lock().unwrap().push((app, version));
                Ok(())
            });
        }

        let last = gc.gc_wait_for(TF2, EMSG_GC_CLIENT_WELCOME, |e| {
            e.body::<CMsgClientWelcome>().and_then(|b| b.version) == Some(3)
        });
        peer.send_envelope(&from_gc(TF2, 1));
        peer.send_envelope(&from_gc(CSGO, 2));
        peer.send_envelope(&from_gc(TF2, 3));
        last.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(TF2, 1), (CSGO, 2), (TF2, 3)]);
    }

    #[tokio::test]
    async fn listeners_filtered_by_app() {
        let (gateway, peer) = gateway();
        let mut registry = GcRegistry::with_base_messages(TF2);
        registry.register_base_messages(CSGO);
        let gc = GcDispatcher::new(gateway, registry);

        let csgo = gc.gc_wait_for(CSGO, EMSG_GC_CLIENT_WELCOME, |_| true);
        peer.send_envelope(&from_gc(TF2, 1));
        peer.send_envelope(&from_gc(CSGO, 2));

        let got = csgo.await.unwrap();
        assert_eq!(got.app_id, CSGO);
        assert_eq!(got.body::<CMsgClientWelcome>().unwrap().version, Some(2));
    }

    #[tokio::test]
    async fn unregistered_app_is_dropped() {
        let (gateway, peer) = gateway();
        let events = gateway.events().clone();
        let gc_events = Arc::new(AtomicU32::new(0));
        let g = gc_events.clone();
        events.subscribe(topics::GC_MESSAGE, move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        let gc = GcDispatcher::new(gateway.clone(), GcRegistry::with_base_messages(TF2));
        assert!(gc.has_message(TF2, EMSG_GC_CLIENT_WELCOME));
        assert!(!gc.has_message(CSGO, EMSG_GC_CLIENT_WELCOME));
        let done = gc.gc_wait_for(TF2, EMSG_GC_CLIENT_WELCOME, |_| true);
        peer.send_envelope(&from_gc(CSGO, 1));
        peer.send_envelope(&from_gc(TF2, 2));
        done.await.unwrap();

        assert_eq!(gc_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_wraps_in_client_to_gc() {
        let (gateway, mut peer) = gateway();
        let gc = GcDispatcher::new(gateway, GcRegistry::with_base_messages(TF2));

        gc.send_proto(TF2, EMSG_GC_CLIENT_HELLO, &CMsgClientHello { version: Some(5) })
            .await
            .unwrap();

        let outer = peer.recv_envelope().await.unwrap();
        assert_eq!(outer.emsg(), Some(EMsg::ClientToGC));
        match &outer.header {
            Header::Proto(h) => assert_eq!(h.proto.routing_appid, Some(TF2)),
            other => panic!("unexpected header {other:?}"),
        }
        let body = outer.body::<CMsgGcClient>().unwrap();
        assert_eq!(body.appid, Some(TF2));
        assert_eq!(body.msgtype, Some(steamcm_core::set_proto_bit(EMSG_GC_CLIENT_HELLO)));
    }

    #[tokio::test]
    async fn call_correlates_job_ids() {
        let (gateway, mut peer) = gateway();
        let gc = GcDispatcher::new(gateway, GcRegistry::with_base_messages(TF2));

        let caller = gc.clone();
        let call = tokio::spawn(async move {
            caller
                .call(TF2, EMSG_GC_CLIENT_HELLO, &CMsgClientHello { version: Some(1) }, EMSG_GC_CLIENT_WELCOME)
                .await
        });

        let outer = peer.recv_envelope().await.unwrap();
        let sent = GcEnvelope::parse(
            outer.body::<CMsgGcClient>().unwrap(),
            &GcRegistry::with_base_messages(TF2),
        )
        .unwrap();
        let job = sent.job_id_source();

        for (target, version) in [(job + 1, 8), (job, 9)] {
            let mut reply = GcEnvelope::proto(
                TF2,
                EMSG_GC_CLIENT_WELCOME,
                &CMsgClientWelcome {
                    version: Some(version),
                    game_data: None,
                },
            );
            reply.header.set_job_id_target(target);
            peer.send_envelope(&Envelope::proto(EMsg::ClientFromGC, reply.to_gc_client()));
        }

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.body::<CMsgClientWelcome>().unwrap().version, Some(9));
    }
}
