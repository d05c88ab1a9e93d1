//! The single push-channel connection and its lifecycle.
//!
//! `disconnected → connecting → connected`, back to `disconnected` on a
//! transport error or an explicit disconnect, and from there to `connecting`
//! again on `connect`/`reconnect`. Opening the stream is bounded by the connect
//! timeout. While connected, a health probe runs once on arrival and then on
//! every heartbeat tick, alongside frame delivery; at most one probe is in
//! flight per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, OptionFuture};
use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::error::SyncError;
use crate::application::repos::HealthProbe;
use crate::cache::lock::mutex_lock;

use super::listeners::{ListenerRegistry, Subscription};
use super::status::{ConnectionState, ConnectionStatus};
use super::transport::{PushFrame, PushTransport};

const SOURCE: &str = "realtime::channel";

const METRIC_REALTIME_EVENT: &str = "sentinel_realtime_event_total";
const METRIC_REALTIME_CONNECTED: &str = "sentinel_realtime_connected";

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Interval between health probes while connected.
    pub heartbeat: Duration,
    /// A session still opening after this long is reported lost.
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl From<&crate::config::RealtimeSettings> for ChannelConfig {
    fn from(settings: &crate::config::RealtimeSettings) -> Self {
        Self {
            heartbeat: settings.heartbeat,
            connect_timeout: settings.connect_timeout,
        }
    }
}

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    probe: Arc<dyn HealthProbe>,
    listeners: ListenerRegistry,
    status: watch::Sender<ConnectionStatus>,
    session: Mutex<Option<JoinHandle<()>>>,
    /// Identifies the current session; a session only reports state while
    /// its generation is current.
    generation: AtomicU64,
    config: ChannelConfig,
}

/// Owns one push-channel connection and fans its events out to listeners.
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        probe: Arc<dyn HealthProbe>,
        config: ChannelConfig,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                probe,
                listeners: ListenerRegistry::new(),
                status,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Register `callback` for `event`. Registrations survive reconnects.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(event, callback)
    }

    /// Start connecting if currently disconnected; otherwise a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut session = mutex_lock(&self.inner.session, SOURCE, "connect");
        if self.state() != ConnectionState::Disconnected {
            debug!(state = self.state().as_str(), "Connect ignored");
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.last_error = None;
        });
        info!(generation, "Push channel connecting");

        if let Some(previous) = session.take() {
            previous.abort();
        }
        *session = Some(tokio::spawn(run_session(
            Arc::clone(&self.inner),
            generation,
        )));
    }

    /// Tear down the current connection, if any.
    pub fn disconnect(&self) {
        let mut session = mutex_lock(&self.inner.session, SOURCE, "disconnect");
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = session.take() {
            handle.abort();
        }
        let changed = self.inner.status.send_if_modified(|status| {
            let changed = status.state != ConnectionState::Disconnected;
            status.state = ConnectionState::Disconnected;
            changed
        });
        if changed {
            gauge!(METRIC_REALTIME_CONNECTED).set(0.0);
            info!("Push channel disconnected");
        }
    }

    /// Replace the current connection with a fresh one. A connection attempt
    /// already under way is left alone, so repeated calls collapse into one.
    pub fn reconnect(&self) {
        if self.state() == ConnectionState::Connecting {
            debug!("Reconnect ignored while connecting");
            return;
        }
        self.disconnect();
        self.connect();
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(handle) = mutex_lock(&self.inner.session, SOURCE, "drop").take() {
            handle.abort();
        }
    }
}

impl ChannelInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn update(&self, generation: u64, apply: impl FnOnce(&mut ConnectionStatus)) -> bool {
        self.status.send_if_modified(|status| {
            if !self.is_current(generation) {
                return false;
            }
            apply(status);
            true
        })
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let updated = self.update(generation, |status| {
            status.state = ConnectionState::Connected;
        });
        if updated {
            gauge!(METRIC_REALTIME_CONNECTED).set(1.0);
            info!(generation, "Push channel connected");
        }
        updated
    }

    fn mark_disconnected(&self, generation: u64, error: &SyncError) {
        let updated = self.update(generation, |status| {
            status.state = ConnectionState::Disconnected;
            status.last_error = Some(error.to_string());
        });
        if updated {
            gauge!(METRIC_REALTIME_CONNECTED).set(0.0);
            warn!(generation, error = %error, "Push channel lost");
        }
    }

    fn start_probe(self: &Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        async move { inner.probe_health(generation).await }.boxed()
    }

    async fn probe_health(&self, generation: u64) {
        match self.probe.check().await {
            Ok(report) => {
                debug!(generation, status = ?report.status, "Health probe succeeded");
                self.update(generation, |status| {
                    status.health = Some(report);
                    status.last_ping = Some(OffsetDateTime::now_utc());
                });
            }
            Err(error) => {
                warn!(generation, error = %error, "Health probe failed");
                self.update(generation, |status| {
                    status.last_error = Some(error.to_string());
                });
            }
        }
    }

    fn deliver(&self, frame: &PushFrame) {
        counter!(METRIC_REALTIME_EVENT, "event" => frame.event.clone()).increment(1);
        let delivered = self.listeners.dispatch(&frame.event, &frame.payload);
        debug!(event = %frame.event, listeners = delivered, "Push event dispatched");
    }
}

async fn run_session(inner: Arc<ChannelInner>, generation: u64) {
    let opened = tokio::time::timeout(inner.config.connect_timeout, inner.transport.open()).await;
    let mut frames = match opened {
        Ok(Ok(frames)) => frames,
        Ok(Err(error)) => {
            inner.mark_disconnected(generation, &error);
            return;
        }
        Err(_) => {
            inner.mark_disconnected(generation, &SyncError::channel("connect timed out"));
            return;
        }
    };

    if !inner.mark_connected(generation) {
        return;
    }

    let period = inner.config.heartbeat;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut probe = Some(inner.start_probe(generation));

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => inner.deliver(&frame),
                Some(Err(error)) => {
                    inner.mark_disconnected(generation, &error);
                    return;
                }
                None => {
                    inner.mark_disconnected(generation, &SyncError::channel("push stream closed"));
                    return;
                }
            },
            _ = heartbeat.tick() => {
                if probe.is_some() {
                    debug!(generation, "Health probe still running, tick skipped");
                } else {
                    probe = Some(inner.start_probe(generation));
                }
            }
            Some(()) = OptionFuture::from(probe.as_mut()) => probe = None,
        }
    }
}
