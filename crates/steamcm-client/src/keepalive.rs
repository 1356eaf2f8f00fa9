//! Heartbeat sender and dead-peer watchdog.
//!
//! Timestamps are milliseconds since the driver was created, stored in
//! atomics and only ever moved forward, so the pump and the send loop can
//! both update them without a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use steamcm_core::protobufs::CMsgClientHeartBeat;
use steamcm_core::{EMsg, Envelope};

use crate::transport::FrameSink;

/// How often the watchdog compares the last acknowledgement to the timeout.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// Shared timestamps. Zero means "never".
#[derive(Debug)]
pub struct KeepAliveState {
    origin: Instant,
    interval_ms: AtomicU64,
    last_send: AtomicU64,
    last_ack: AtomicU64,
    latency_ms: AtomicU64,
}

impl KeepAliveState {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: AtomicU64::new(0),
            last_send: AtomicU64::new(0),
            last_ack: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64 + 1
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    fn record_send(&self) {
        self.last_send.fetch_max(self.now_ms(), Ordering::Relaxed);
    }

    /// Record an acknowledgement and recompute latency as
    /// `last_ack - last_send - interval`.
    fn record_ack(&self) -> Duration {
        let now = self.now_ms();
        self.last_ack.fetch_max(now, Ordering::Relaxed);
        let last_send = self.last_send.load(Ordering::Relaxed);
        if last_send == 0 {
            return Duration::ZERO;
        }
        let interval = self.interval_ms.load(Ordering::Relaxed);
        let latency = now.saturating_sub(last_send).saturating_sub(interval);
        self.latency_ms.store(latency, Ordering::Relaxed);
        Duration::from_millis(latency)
    }

    fn since_ack(&self) -> Duration {
        let last = self.last_ack.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// Parameters handed to [`KeepAlive::start`].
#[derive(Debug, Clone)]
pub struct HeartbeatParams {
    /// Send cadence from the logon response.
    pub interval: Duration,
    /// Silence after which the connection is torn down.
    pub timeout: Duration,
    /// Latency beyond `interval * lag_warning_multiple` is reported.
    pub lag_warning_multiple: u32,
    pub steam_id: u64,
    pub session_id: i32,
}

/// Keep-alive driver for one connection.
pub struct KeepAlive {
    state: Arc<KeepAliveState>,
    lag_warning_multiple: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAlive {
    pub fn new() -> Self {
        Self {
            state: Arc::new(KeepAliveState::new()),
            lag_warning_multiple: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<KeepAliveState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Note an inbound frame. Returns the latency when it exceeds the
    /// warning threshold; the connection is left alone either way.
    pub fn record_ack(&self) -> Option<Duration> {
        let latency = self.state.record_ack();
        let multiple = self.lag_warning_multiple.load(Ordering::Relaxed);
        let interval = self.state.interval();
        if multiple == 0 || interval.is_zero() {
            return None;
        }
        if latency > interval * multiple as u32 {
            warn!(
                latency_ms = latency.as_millis() as u64,
                interval_secs = interval.as_secs(),
                "heartbeat acknowledgements lagging"
            );
            return Some(latency);
        }
        None
    }

    /// Start sending heartbeats through `sink`. When no acknowledgement
    /// arrives within `params.timeout`, or a heartbeat cannot be written, the
    /// sink is closed and `true` is published on `shutdown`.
    pub fn start(
        &self,
        params: HeartbeatParams,
        sink: Arc<dyn FrameSink>,
        shutdown: Arc<watch::Sender<bool>>,
    ) {
        self.stop();

        let interval = params.interval.max(Duration::from_millis(1));
        self.state
            .interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        self.lag_warning_multiple
            .store(params.lag_warning_multiple as u64, Ordering::Relaxed);
        self.state.record_ack();

        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut heartbeat = time::interval_at(Instant::now() + interval, interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut watchdog = time::interval(WATCHDOG_PERIOD);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut frame = Envelope::proto(
                EMsg::ClientHeartBeat,
                CMsgClientHeartBeat {
                    send_reply: Some(true),
                },
            );
            frame.header.stamp_session(params.steam_id, params.session_id);
            let frame = frame.to_bytes();

            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if let Err(e) = sink.send_frame(frame.clone()).await {
                            warn!(error = %e, "heartbeat write failed");
                            break;
                        }
                        state.record_send();
                        debug!("heartbeat sent");
                    }
                    _ = watchdog.tick() => {
                        let silent = state.since_ack();
                        if silent > params.timeout {
                            warn!(
                                silent_secs = silent.as_secs(),
                                timeout_secs = params.timeout.as_secs(),
                                "no acknowledgement from server, closing connection"
                            );
                            break;
                        }
                    }
                }
            }

            let _ = sink.close().await;
            shutdown.send_replace(true);
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Cancel the send loop.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    fn params(interval: u64, timeout: u64) -> HeartbeatParams {
        HeartbeatParams {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
            lag_warning_multiple: 3,
            steam_id: 76561197960287930,
            session_id: 42,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_stamped_heartbeats_on_interval() {
        let (transport, mut peer) = memory::pair();
        let (tx, _rx) = watch::channel(false);
        let keepalive = KeepAlive::new();
        keepalive.start(params(10, 60), transport.sink.clone(), Arc::new(tx));

        for _ in 0..3 {
            let env = peer.recv_envelope().await.unwrap();
            assert_eq!(env.emsg(), Some(EMsg::ClientHeartBeat));
            assert_eq!(env.header.session_id(), Some(42));
            assert_eq!(env.header.steam_id(), Some(76561197960287930));
            keepalive.record_ack();
        }
        assert!(keepalive.is_running());
        keepalive.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_timeout_tears_down() {
        let (transport, mut peer) = memory::pair();
        let (tx, mut rx) = watch::channel(false);
        let keepalive = KeepAlive::new();
        keepalive.start(params(10, 60), transport.sink.clone(), Arc::new(tx));

        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // Heartbeats went out until the sink was closed.
        let mut sent = 0;
        while peer.recv().await.is_some() {
            sent += 1;
        }
        assert!(sent >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_connection_stays_up() {
        let (transport, mut peer) = memory::pair();
        let (tx, rx) = watch::channel(false);
        let keepalive = KeepAlive::new();
        keepalive.start(params(10, 30), transport.sink.clone(), Arc::new(tx));

        for _ in 0..10 {
            peer.recv().await.unwrap();
            keepalive.record_ack();
        }
        assert!(!*rx.borrow());
        keepalive.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn latency_subtracts_interval() {
        let keepalive = KeepAlive::new();
        let state = keepalive.state().clone();
        state.interval_ms.store(10_000, Ordering::Relaxed);
        keepalive.lag_warning_multiple.store(3, Ordering::Relaxed);

        state.record_send();
        time::advance(Duration::from_secs(12)).await;
        assert_eq!(keepalive.record_ack(), None);
        assert_eq!(state.latency(), Duration::from_secs(2));

        state.record_send();
        time::advance(Duration::from_secs(45)).await;
        assert_eq!(keepalive.record_ack(), Some(Duration::from_secs(35)));
    }

    #[tokio::test]
    async fn ack_before_any_send_has_no_latency() {
        let keepalive = KeepAlive::new();
        assert_eq!(keepalive.record_ack(), None);
        assert_eq!(keepalive.state().latency(), Duration::ZERO);
    }
}
