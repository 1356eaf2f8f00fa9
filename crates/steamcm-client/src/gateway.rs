//! Gateway connection.
//!
//! `Gateway` owns one duplex transport to a CM server. Connecting walks a
//! candidate list: open the socket, start the inbound pump, send the logon
//! and wait for its response. The pump reads one frame at a time, handles the
//! connection-management messages inline (Multi, logon response, CM list,
//! logged off) and hands everything else to the [`Dispatcher`].
//!
//! Reconnecting is left to the caller: a dead connection surfaces as
//! [`CmError::ConnectionClosed`] from [`Gateway::wait_closed`] carrying the
//! address, and [`Gateway::servers`] gives access to the list to mark it bad.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use steamcm_core::protobufs::{
    CMsgClientCmList, CMsgClientLogOff, CMsgClientLoggedOff, CMsgClientLogon,
    CMsgClientLogonResponse, CMsgMulti,
};
use steamcm_core::{CmBody, CmError, CmResult, EMsg, EResult, Envelope};

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::dispatch::{Dispatcher, Handler, Waiter};
use crate::events::{topics, Event, EventBus};
use crate::keepalive::{HeartbeatParams, KeepAlive};
use crate::multi;
use crate::servers::{ServerCandidate, ServerList};
use crate::transport::{Connector, FrameSink, FrameSource, Transport, WebSocketConnector};

/// Heartbeat cadence used when the logon response names none.
const DEFAULT_HEARTBEAT_SECS: u64 = 9;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    LoggingOn,
    Connected,
}

/// Collaborators a connection is built from.
#[derive(Clone)]
pub struct ConnectOptions {
    pub config: ClientConfig,
    pub credentials: Arc<dyn Credentials>,
    pub servers: Arc<ServerList>,
    pub connector: Arc<dyn Connector>,
    pub events: Arc<EventBus>,
}

impl ConnectOptions {
    /// HTTP directory, WebSocket transport and a fresh event bus, all per
    /// `config`.
    pub fn new(config: ClientConfig, credentials: Arc<dyn Credentials>) -> Self {
        let servers = Arc::new(ServerList::from_config(&config));
        let connector = Arc::new(WebSocketConnector::new(config.connect_timeout()));
        Self {
            config,
            credentials,
            servers,
            connector,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_servers(mut self, servers: Arc<ServerList>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }
}

struct Inner {
    address: String,
    config: ClientConfig,
    sink: Arc<dyn FrameSink>,
    dispatcher: Dispatcher,
    servers: Arc<ServerList>,
    keepalive: KeepAlive,
    state: Mutex<ConnectionState>,
    steam_id: AtomicU64,
    session_id: AtomicI32,
    next_job: AtomicU64,
    shutdown: Arc<watch::Sender<bool>>,
    closed: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live (or finished) connection. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Pick candidates from the server list and connect to the best one.
    ///
    /// On failure no gateway exists to reach the list through, so callers
    /// that want to mark the failed address bad themselves should keep the
    /// `Arc<ServerList>` they passed in [`ConnectOptions::with_servers`].
    pub async fn connect(options: ConnectOptions) -> CmResult<Self> {
        let candidates = options.servers.best_candidates().await?;
        Self::connect_to(options, candidates).await
    }

    /// Connect and log on, advancing through `candidates` on failure.
    ///
    /// Socket failures and server-unavailable rejections mark the address
    /// bad and move on. A credential rejection refreshes the credentials once
    /// and moves on; a second one, or any other rejection, is returned.
    ///
    /// Running out of candidates yields [`CmError::ConnectionClosed`] for the
    /// last address tried. Addresses that failed along the way are already
    /// marked bad on `options.servers`, which the caller keeps its own handle
    /// to.
    pub async fn connect_to(
        options: ConnectOptions,
        candidates: impl IntoIterator<Item = ServerCandidate>,
    ) -> CmResult<Self> {
        let mut refreshed = false;
        let mut last_address: Option<String> = None;

        for candidate in candidates {
            let address = candidate.address;
            last_address = Some(address.clone());

            info!(%address, score = candidate.score, "connecting");
            let transport = match options.connector.connect(&address).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(%address, error = %e, "socket open failed");
                    options.servers.mark_bad(&address).await;
                    continue;
                }
            };

            let gateway = Self::from_transport(address.clone(), transport, &options);
            match gateway.log_on(options.credentials.as_ref()).await {
                Ok(()) => return Ok(gateway),
                Err(CmError::LogonRejected(result)) if result.is_credential_failure() => {
                    gateway.shutdown().await;
                    if refreshed {
                        return Err(CmError::LogonRejected(result));
                    }
                    warn!(%address, ?result, "credentials rejected, refreshing");
                    refreshed = true;
                    options.credentials.refresh().await?;
                }
                Err(CmError::LogonRejected(result)) if result.is_server_unavailable() => {
                    warn!(%address, ?result, "server unavailable");
                    gateway.shutdown().await;
                    options.servers.mark_bad(&address).await;
                }
                Err(e @ CmError::LogonRejected(_)) => {
                    gateway.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(%address, error = %e, "logon failed");
                    gateway.shutdown().await;
                    options.servers.mark_bad(&address).await;
                }
            }
        }

        match last_address {
            Some(address) => Err(CmError::ConnectionClosed { address }),
            None => Err(CmError::NoServersFound),
        }
    }

    /// Wrap an already-open transport and start its inbound pump. No logon
    /// is sent.
    pub fn from_transport(address: String, transport: Transport, options: &ConnectOptions) -> Self {
        let Transport { sink, source } = transport;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            address: address.clone(),
            config: options.config.clone(),
            sink,
            dispatcher: Dispatcher::new(options.events.clone()),
            servers: options.servers.clone(),
            keepalive: KeepAlive::new(),
            state: Mutex::new(ConnectionState::Connecting),
            steam_id: AtomicU64::new(0),
            session_id: AtomicI32::new(0),
            next_job: AtomicU64::new(1),
            shutdown: Arc::new(shutdown),
            closed,
            pump: Mutex::new(None),
        });

        let handle = tokio::spawn(run_pump(Arc::downgrade(&inner), source, shutdown_rx));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        options
            .events
            .emit(&Event::new(topics::CONNECT, serde_json::json!({ "address": address })));

        Self { inner }
    }

    async fn log_on(&self, credentials: &dyn Credentials) -> CmResult<()> {
        let response = self.wait_for(EMsg::ClientLogOnResponse, |_| true);
        self.inner.set_state(ConnectionState::LoggingOn);
        self.send(self.logon_envelope(credentials)).await?;

        let response = tokio::time::timeout(self.inner.config.request_timeout(), response)
            .await
            .map_err(|_| CmError::Timeout)?
            .map_err(|_| CmError::ConnectionClosed {
                address: self.inner.address.clone(),
            })?;

        let result = logon_result(&response);
        if result == EResult::Ok {
            Ok(())
        } else {
            Err(CmError::LogonRejected(result))
        }
    }

    fn logon_envelope(&self, credentials: &dyn Credentials) -> Envelope {
        let connection = &self.inner.config.connection;
        let steam_id = credentials.steam_id();
        let mut envelope = Envelope::proto(
            EMsg::ClientLogon,
            CMsgClientLogon {
                protocol_version: Some(connection.protocol_version),
                cell_id: Some(self.inner.config.directory.cell_id),
                client_language: Some(connection.client_language.clone()),
                client_os_type: Some(connection.client_os_type),
                should_remember_password: Some(true),
                client_supplied_steam_id: Some(steam_id.as_u64()),
                account_name: Some(credentials.username()),
                access_token: Some(credentials.access_token()),
                ..Default::default()
            },
        );
        envelope.header.stamp_session(steam_id.as_u64(), 0);
        envelope
    }

    /// Stamp the session into the header and write the envelope. Write
    /// failures are returned as-is; nothing is retried.
    pub async fn send(&self, mut envelope: Envelope) -> CmResult<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(CmError::ConnectionClosed {
                address: self.inner.address.clone(),
            });
        }
        let steam_id = self.inner.steam_id.load(Ordering::Relaxed);
        if steam_id != 0 {
            envelope
                .header
                .stamp_session(steam_id, self.inner.session_id.load(Ordering::Relaxed));
        }
        debug!(msg = envelope.msg, "sending");
        self.inner.sink.send_frame(envelope.to_bytes()).await
    }

    /// Resolves with the next `msg` envelope accepted by `predicate`.
    /// Registration happens immediately, so a reply to a message sent after
    /// this call cannot be missed.
    pub fn wait_for(
        &self,
        msg: EMsg,
        predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static,
    ) -> Waiter<Envelope> {
        self.inner.dispatcher.wait_for(msg, predicate)
    }

    /// Install the parser run for every `msg` envelope.
    pub fn register_parser(
        &self,
        msg: EMsg,
        handler: impl Fn(&Arc<Envelope>) -> CmResult<()> + Send + Sync + 'static,
    ) -> Option<Handler<Envelope>> {
        self.inner.dispatcher.register_parser(msg, handler)
    }

    pub fn remove_parser(&self, msg: EMsg) -> Option<Handler<Envelope>> {
        self.inner.dispatcher.remove_parser(msg)
    }

    /// Call a unified service method and wait for the response carrying the
    /// same job id. A non-OK result in the response header is
    /// [`CmError::Service`].
    pub async fn call_service(
        &self,
        method: &str,
        body: impl Into<CmBody>,
    ) -> CmResult<Arc<Envelope>> {
        let emsg = if self.state() == ConnectionState::Connected {
            EMsg::ServiceMethodCallFromClient
        } else {
            EMsg::ServiceMethodCallFromClientNonAuthed
        };
        let job = self.next_job_id();
        let mut envelope = Envelope::service_call(emsg, method, body);
        envelope.header.set_job_id_source(job);

        let response = self.wait_for(EMsg::ServiceMethodResponse, move |e| {
            e.job_id_target() == job
        });
        self.send(envelope).await?;

        let response = tokio::time::timeout(self.inner.config.request_timeout(), response)
            .await
            .map_err(|_| CmError::Timeout)??;

        let result = response.eresult();
        if result != EResult::Ok {
            debug!(method, job, ?result, "service call failed");
            return Err(CmError::Service(result));
        }
        Ok(response)
    }

    /// Fresh job id for request/response correlation.
    pub fn next_job_id(&self) -> u64 {
        self.inner.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Log off, stop the keep-alive and close the socket. Returns once the
    /// pump has exited.
    pub async fn close(&self) -> CmResult<()> {
        if self.state() == ConnectionState::Connected {
            let logoff = Envelope::proto(EMsg::ClientLogOff, CMsgClientLogOff {});
            if let Err(e) = self.send(logoff).await {
                debug!(error = %e, "log off not sent");
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.keepalive.stop();
        let _ = self.inner.sink.close().await;
        self.inner.request_shutdown();
        let pump = self.inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.inner.teardown("closed locally");
    }

    /// Wait for the connection to end, however it ends.
    pub async fn wait_closed(&self) -> CmError {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
        CmError::ConnectionClosed {
            address: self.inner.address.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn servers(&self) -> &Arc<ServerList> {
        &self.inner.servers
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.inner.dispatcher.events()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Peer id assigned at logon, zero before.
    pub fn steam_id(&self) -> u64 {
        self.inner.steam_id.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> i32 {
        self.inner.session_id.load(Ordering::Relaxed)
    }

    /// Last computed heartbeat latency.
    pub fn latency(&self) -> Duration {
        self.inner.keepalive.state().latency()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != ConnectionState::Disconnected {
            *current = state;
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn emit(&self, event: Event) {
        self.dispatcher.events().emit(&event);
    }

    /// Pump entry point for one frame off the wire. Sub-messages of a Multi
    /// are queued ahead of anything else, in order.
    async fn feed(&self, frame: Vec<u8>) {
        if let Some(lag) = self.keepalive.record_ack() {
            self.emit(Event::new(
                topics::HEARTBEAT_LAG,
                serde_json::json!({ "latency_ms": lag.as_millis() as u64 }),
            ));
        }

        let mut queue = VecDeque::from([frame]);
        while let Some(frame) = queue.pop_front() {
            let envelope = match Envelope::parse(&frame) {
                Ok(envelope) => envelope,
                Err(e) if is_routine_drop(&e) => {
                    debug!(error = %e, len = frame.len(), "dropping undecodable body");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, len = frame.len(), "dropping malformed frame");
                    continue;
                }
            };

            match envelope.emsg() {
                Some(EMsg::Multi) => {
                    let Some(body) = envelope.body::<CMsgMulti>().cloned() else {
                        warn!("multi without a body");
                        continue;
                    };
                    match multi::unpack(body).await {
                        Ok(frames) => {
                            debug!(count = frames.len(), "unpacked multi");
                            for (i, sub) in frames.into_iter().enumerate() {
                                queue.insert(i, sub);
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping multi"),
                    }
                }
                Some(EMsg::ClientLogOnResponse) => {
                    let envelope = Arc::new(envelope);
                    self.on_logon_response(&envelope);
                    self.dispatcher.notify(envelope);
                }
                Some(EMsg::ClientLoggedOff) => {
                    let envelope = Arc::new(envelope);
                    let result = envelope
                        .body::<CMsgClientLoggedOff>()
                        .and_then(|b| b.eresult)
                        .map(EResult::from)
                        .unwrap_or(EResult::Invalid);
                    warn!(address = %self.address, ?result, "logged off by server");
                    self.emit(Event::new(
                        topics::LOGGED_OFF,
                        serde_json::json!({ "eresult": i32::from(result) }),
                    ));
                    self.dispatcher.notify(envelope);
                    self.request_shutdown();
                }
                Some(EMsg::ClientCMList) => {
                    if let Some(list) = envelope.body::<CMsgClientCmList>() {
                        debug!(count = list.cm_websocket_addresses.len(), "server pushed CM list");
                        self.servers
                            .extend(list.cm_websocket_addresses.iter().cloned())
                            .await;
                    }
                    self.dispatcher.dispatch(Arc::new(envelope));
                }
                _ => self.dispatcher.dispatch(Arc::new(envelope)),
            }
        }
    }

    fn on_logon_response(&self, envelope: &Envelope) {
        let result = logon_result(envelope);
        if result != EResult::Ok {
            debug!(address = %self.address, ?result, "logon refused");
            return;
        }

        let steam_id = envelope.header.steam_id().unwrap_or(0);
        let session_id = envelope.header.session_id().unwrap_or(0);
        self.steam_id.store(steam_id, Ordering::Relaxed);
        self.session_id.store(session_id, Ordering::Relaxed);

        let heartbeat_secs = envelope
            .body::<CMsgClientLogonResponse>()
            .and_then(|b| b.heartbeat_seconds.or(b.legacy_out_of_game_heartbeat_seconds))
            .filter(|s| *s > 0)
            .map(|s| s as u64)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        self.keepalive.start(
            HeartbeatParams {
                interval: Duration::from_secs(heartbeat_secs),
                timeout: self.config.heartbeat_timeout(),
                lag_warning_multiple: self.config.connection.lag_warning_multiple,
                steam_id,
                session_id,
            },
            self.sink.clone(),
            self.shutdown.clone(),
        );
        self.set_state(ConnectionState::Connected);

        info!(address = %self.address, steam_id, session_id, heartbeat_secs, "logged on");
        self.emit(Event::new(
            topics::LOGGED_ON,
            serde_json::json!({
                "address": self.address,
                "steam_id": steam_id,
                "session_id": session_id,
                "heartbeat_seconds": heartbeat_secs,
            }),
        ));
    }

    /// Move to Disconnected once, cancelling waiters and announcing it.
    fn teardown(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.keepalive.stop();
        self.dispatcher.cancel_all();
        self.closed.send_replace(true);

        info!(address = %self.address, reason, "connection closed");
        self.emit(Event::new(
            topics::DISCONNECT,
            serde_json::json!({ "address": self.address, "reason": reason }),
        ));
    }
}

/// Body decode failures are expected with partial message coverage; header
/// damage is not.
fn is_routine_drop(error: &CmError) -> bool {
    matches!(error, CmError::Decode(_))
}

fn logon_result(envelope: &Envelope) -> EResult {
    envelope
        .body::<CMsgClientLogonResponse>()
        .and_then(|b| b.eresult)
        .map(EResult::from)
        .unwrap_or(EResult::Fail)
}

async fn run_pump(
    inner: Weak<Inner>,
    mut source: Box<dyn FrameSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        if *shutdown.borrow() {
            break "shutdown requested";
        }
        let frame = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break "connection dropped";
                }
                continue;
            }
            frame = source.next_frame() => frame,
        };

        match frame {
            Ok(Some(frame)) => {
                let Some(inner) = inner.upgrade() else {
                    break "connection dropped";
                };
                inner.feed(frame).await;
            }
            Ok(None) => break "closed by server",
            Err(e) => {
                error!(error = %e, "transport read failed");
                break "transport error";
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        let _ = inner.sink.close().await;
        inner.teardown(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::future::Future;
    use std::pin::Pin;

    use steamcm_core::multi as core_multi;
    use steamcm_core::protobufs::{
        CMsgClientHeartBeat, CPlayerGetGameBadgeLevelsRequest, CPlayerGetGameBadgeLevelsResponse,
    };
    use steamcm_core::SteamId;

    use crate::servers::tests::MockDirectory;
    use crate::transport::memory::{self, MemoryConnector, MemoryPeer};

    const STEAM_ID: u64 = 76561197960287930;

    struct CountingCredentials {
        refreshes: AtomicU32,
    }

    impl Credentials for CountingCredentials {
        fn username(&self) -> String {
            "gaben".to_string()
        }

        fn steam_id(&self) -> SteamId {
            SteamId::from(STEAM_ID)
        }

        fn access_token(&self) -> String {
            "token".to_string()
        }

        fn refresh(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn options(connector: Arc<MemoryConnector>) -> (ConnectOptions, Arc<CountingCredentials>) {
        let credentials = Arc::new(CountingCredentials {
            refreshes: AtomicU32::new(0),
        });
        let servers = Arc::new(ServerList::new(Arc::new(MockDirectory::ok(&[])), 0, 10));
        let options = ConnectOptions {
            config: ClientConfig::default(),
            credentials: credentials.clone(),
            servers,
            connector,
            events: Arc::new(EventBus::new()),
        };
        (options, credentials)
    }

    fn candidates(addresses: &[&str]) -> Vec<ServerCandidate> {
        addresses
            .iter()
            .map(|a| ServerCandidate::good(*a, 0.0))
            .collect()
    }

    fn logon_response(result: EResult, session_id: i32) -> Envelope {
        let mut envelope = Envelope::proto(
            EMsg::ClientLogOnResponse,
            CMsgClientLogonResponse {
                eresult: Some(result.into()),
                heartbeat_seconds: Some(9),
                ..Default::default()
            },
        );
        envelope.header.stamp_session(STEAM_ID, session_id);
        envelope
    }

    fn heartbeat(job: u64) -> Envelope {
        let mut envelope = Envelope::proto(EMsg::ClientHeartBeat, CMsgClientHeartBeat::default());
        envelope.header.set_job_id_target(job);
        envelope
    }

    async fn answer_logon(peer: &mut MemoryPeer, result: EResult) {
        let logon = peer.recv_envelope().await.unwrap();
        assert_eq!(logon.emsg(), Some(EMsg::ClientLogon));
        peer.send_envelope(&logon_response(result, 7));
    }

    /// A gateway over a memory pair, logged on with session 7.
    async fn logged_on() -> (Gateway, MemoryPeer) {
        let (transport, mut peer) = memory::pair();
        let (options, credentials) = options(Arc::new(MemoryConnector::new()));
        let gateway = Gateway::from_transport("mem:1".into(), transport, &options);
        let g = gateway.clone();
        let logon = tokio::spawn(async move { g.log_on(credentials.as_ref()).await });
        answer_logon(&mut peer, EResult::Ok).await;
        logon.await.unwrap().unwrap();
        (gateway, peer)
    }

    #[tokio::test]
    async fn connect_logs_on_and_stamps_session() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.listen("a:1");
        let (options, _) = options(connector);

        let connecting = tokio::spawn(Gateway::connect_to(options, candidates(&["a:1"])));
        let logon = peer.recv_envelope().await.unwrap();
        let body = logon.body::<CMsgClientLogon>().unwrap();
        assert_eq!(body.account_name.as_deref(), Some("gaben"));
        assert_eq!(body.access_token.as_deref(), Some("token"));
        assert_eq!(body.protocol_version, Some(65580));
        assert_eq!(logon.header.steam_id(), Some(STEAM_ID));
        peer.send_envelope(&logon_response(EResult::Ok, 7));

        let gateway = connecting.await.unwrap().unwrap();
        assert_eq!(gateway.state(), ConnectionState::Connected);
        assert_eq!(gateway.session_id(), 7);

        gateway.send(heartbeat(1)).await.unwrap();
        let sent = peer.recv_envelope().await.unwrap();
        assert_eq!(sent.header.session_id(), Some(7));
        assert_eq!(sent.header.steam_id(), Some(STEAM_ID));
        gateway.close().await.unwrap();
    }

    #[tokio::test]
    async fn refused_socket_advances_to_next_candidate() {
        let connector = Arc::new(MemoryConnector::new());
        let mut peer = connector.listen("b:2");
        let (options, _) = options(connector);
        let servers = options.servers.clone();

        let connecting = tokio::spawn(Gateway::connect_to(options, candidates(&["a:1", "b:2"])));
        answer_logon(&mut peer, EResult::Ok).await;
        let gateway = connecting.await.unwrap().unwrap();

        assert_eq!(gateway.address(), "b:2");
        let a = servers
            .current()
            .await
            .into_iter()
            .find(|c| c.address == "a:1")
            .unwrap();
        assert_eq!(a.quality, crate::servers::Quality::Bad);
    }

    #[tokio::test]
    async fn credential_rejection_refreshes_once_then_moves_on() {
        let connector = Arc::new(MemoryConnector::new());
        let mut a = connector.listen("a:1");
        let mut b = connector.listen("b:2");
        let (options, credentials) = options(connector);

        let connecting = tokio::spawn(Gateway::connect_to(options, candidates(&["a:1", "b:2"])));
        answer_logon(&mut a, EResult::InvalidPassword).await;
        answer_logon(&mut b, EResult::Ok).await;

        let gateway = connecting.await.unwrap().unwrap();
        assert_eq!(gateway.address(), "b:2");
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_credential_rejection_is_fatal() {
        let connector = Arc::new(MemoryConnector::new());
        let mut a = connector.listen("a:1");
        let mut b = connector.listen("b:2");
        let _c = connector.listen("c:3");
        let (options, credentials) = options(connector);

        let connecting = tokio::spawn(Gateway::connect_to(
            options,
            candidates(&["a:1", "b:2", "c:3"]),
        ));
        answer_logon(&mut a, EResult::InvalidPassword).await;
        answer_logon(&mut b, EResult::AccessDenied).await;

        assert!(matches!(
            connecting.await.unwrap(),
            Err(CmError::LogonRejected(EResult::AccessDenied))
        ));
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_rejection_is_fatal() {
        let connector = Arc::new(MemoryConnector::new());
        let mut a = connector.listen("a:1");
        let _b = connector.listen("b:2");
        let (options, _) = options(connector);

        let connecting = tokio::spawn(Gateway::connect_to(options, candidates(&["a:1", "b:2"])));
        answer_logon(&mut a, EResult::Banned).await;
        assert!(matches!(
            connecting.await.unwrap(),
            Err(CmError::LogonRejected(EResult::Banned))
        ));
    }

    #[tokio::test]
    async fn exhausted_candidates() {
        let (options, _) = options(Arc::new(MemoryConnector::new()));
        let err = Gateway::connect_to(options.clone(), candidates(&["a:1", "b:2"]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.failed_address(), Some("b:2"));

        assert!(matches!(
            Gateway::connect_to(options, Vec::new()).await,
            Err(CmError::NoServersFound)
        ));
    }

    #[tokio::test]
    async fn connect_without_servers_fails() {
        let (options, _) = options(Arc::new(MemoryConnector::new()));
        assert!(matches!(
            Gateway::connect(options).await,
            Err(CmError::NoServersFound)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_does_not_stop_pump() {
        let (gateway, peer) = logged_on().await;
        let waiter = gateway.wait_for(EMsg::ClientHeartBeat, |_| true);

        peer.send(vec![0x01, 0x02, 0x03, 0x04, 0x05]);
        peer.send_envelope(&heartbeat(11));

        assert_eq!(waiter.await.unwrap().job_id_target(), 11);
        assert_eq!(gateway.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_quietly() {
        let (gateway, peer) = logged_on().await;
        let waiter = gateway.wait_for(EMsg::ClientHeartBeat, |e| e.job_id_target() == 12);

        let mut bad = Envelope::proto(EMsg::ClientHeartBeat, CMsgClientHeartBeat::default()).to_bytes();
        bad.extend_from_slice(&[0x08, 0xff]);
        let err = Envelope::parse(&bad).unwrap_err();
        assert!(is_routine_drop(&err));
        assert!(!is_routine_drop(&CmError::Framing("short".into())));

        peer.send(bad);
        peer.send_envelope(&heartbeat(12));
        assert_eq!(waiter.await.unwrap().job_id_target(), 12);
        assert_eq!(gateway.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn multi_sub_messages_dispatch_in_order() {
        let (gateway, peer) = logged_on().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        gateway.register_parser(EMsg::ClientHeartBeat, move |e| {
            s.lock().unwrap().push(e.job_id_target());
            Ok(())
        });

        let frames: Vec<Vec<u8>> = (1..=3).map(|j| heartbeat(j).to_bytes()).collect();
        let body = core_multi::pack(&frames, true).unwrap();
        let done = gateway.wait_for(EMsg::ClientHeartBeat, |e| e.job_id_target() == 3);
        peer.send_envelope(&Envelope::proto(EMsg::Multi, body));
        done.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn multi_with_wrong_size_dispatches_nothing() {
        let (gateway, peer) = logged_on().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        gateway.register_parser(EMsg::ClientHeartBeat, move |e| {
            s.lock().unwrap().push(e.job_id_target());
            Ok(())
        });

        let frames: Vec<Vec<u8>> = (1..=3).map(|j| heartbeat(j).to_bytes()).collect();
        let mut body = core_multi::pack(&frames, true).unwrap();
        body.size_unzipped = body.size_unzipped.map(|n| n - 1);
        peer.send_envelope(&Envelope::proto(EMsg::Multi, body));

        let sentinel = gateway.wait_for(EMsg::ClientHeartBeat, |e| e.job_id_target() == 99);
        peer.send_envelope(&heartbeat(99));
        sentinel.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![99]);
    }

    #[tokio::test]
    async fn service_call_matches_job_id() {
        let (gateway, mut peer) = logged_on().await;
        let method = "Player.GetGameBadgeLevels#1";

        let g = gateway.clone();
        let call = tokio::spawn(async move {
            g.call_service(method, CPlayerGetGameBadgeLevelsRequest { appid: Some(440) })
                .await
        });

        let request = peer.recv_envelope().await.unwrap();
        assert_eq!(request.emsg(), Some(EMsg::ServiceMethodCallFromClient));
        assert_eq!(request.header.target_job_name(), Some(method));
        assert_eq!(request.header.session_id(), Some(7));
        let job = request.job_id_source();

        for (target, level) in [(job + 100, 1), (job, 42)] {
            let mut response = Envelope::service_call(
                EMsg::ServiceMethodResponse,
                method,
                CPlayerGetGameBadgeLevelsResponse {
                    player_level: Some(level),
                    badges: Vec::new(),
                },
            );
            response.header.set_job_id_target(target);
            response.header.set_eresult(EResult::Ok);
            peer.send_envelope(&response);
        }

        let response = call.await.unwrap().unwrap();
        let body = response.body::<CPlayerGetGameBadgeLevelsResponse>().unwrap();
        assert_eq!(body.player_level, Some(42));
    }

    #[tokio::test]
    async fn service_call_error_result() {
        let (gateway, mut peer) = logged_on().await;
        let method = "Player.GetGameBadgeLevels#1";

        let g = gateway.clone();
        let call = tokio::spawn(async move {
            g.call_service(method, CPlayerGetGameBadgeLevelsRequest { appid: Some(440) })
                .await
        });

        let request = peer.recv_envelope().await.unwrap();
        let mut response = Envelope::service_call(
            EMsg::ServiceMethodResponse,
            method,
            CPlayerGetGameBadgeLevelsResponse::default(),
        );
        response.header.set_job_id_target(request.job_id_source());
        response.header.set_eresult(EResult::AccessDenied);
        peer.send_envelope(&response);

        assert!(matches!(
            call.await.unwrap(),
            Err(CmError::Service(EResult::AccessDenied))
        ));
    }

    #[tokio::test]
    async fn cm_list_push_extends_servers() {
        let (gateway, peer) = logged_on().await;
        let waiter = gateway.wait_for(EMsg::ClientCMList, |_| true);
        peer.send_envelope(&Envelope::proto(
            EMsg::ClientCMList,
            CMsgClientCmList {
                cm_websocket_addresses: vec!["new:443".into()],
                ..Default::default()
            },
        ));
        waiter.await.unwrap();

        let current = gateway.servers().current().await;
        assert!(current.iter().any(|c| c.address == "new:443"));
    }

    #[tokio::test]
    async fn logged_off_closes_connection() {
        let (gateway, peer) = logged_on().await;
        let logged_off = Arc::new(AtomicU32::new(0));
        let l = logged_off.clone();
        gateway.events().subscribe(topics::LOGGED_OFF, move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        peer.send_envelope(&Envelope::proto(
            EMsg::ClientLoggedOff,
            CMsgClientLoggedOff {
                eresult: Some(EResult::LoggedInElsewhere.into()),
            },
        ));

        let err = gateway.wait_closed().await;
        assert_eq!(err.failed_address(), Some("mem:1"));
        assert_eq!(logged_off.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn peer_close_cancels_waiters() {
        let (gateway, mut peer) = logged_on().await;
        let waiter = gateway.wait_for(EMsg::ClientHeartBeat, |_| true);
        peer.close();
        assert!(matches!(waiter.await, Err(CmError::Cancelled)));
        gateway.wait_closed().await;
        assert!(gateway.send(heartbeat(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (gateway, mut peer) = logged_on().await;
        let disconnects = Arc::new(AtomicU32::new(0));
        let d = disconnects.clone();
        gateway.events().subscribe(topics::DISCONNECT, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        // Drain heartbeats without answering them.
        let drain = tokio::spawn(async move { while peer.recv().await.is_some() {} });

        let err = gateway.wait_closed().await;
        assert!(matches!(err, CmError::ConnectionClosed { .. }));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn close_sends_log_off() {
        let (gateway, mut peer) = logged_on().await;
        gateway.close().await.unwrap();
        let logoff = peer.recv_envelope().await.unwrap();
        assert_eq!(logoff.emsg(), Some(EMsg::ClientLogOff));
        assert_eq!(gateway.state(), ConnectionState::Disconnected);
    }
}
