// Realtime connection manager: one logical push channel per session.
//
// Owns the channel lifecycle: connect, reconnect-on-close with bounded
// exponential backoff, and clean teardown. Inbound frames are decoded into
// event envelopes and fanned out through the subscription registry.
//
// Every channel task belongs to a credential epoch. `connect` and
// `teardown` bump the epoch and stop the previous task, so a reconnect
// timer armed for an old credential can never fire a connection attempt.

pub mod transport;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use feedsync_common::protocol::envelope::EventEnvelope;
use feedsync_common::types::UserId;

use crate::config::{RealtimeConfig, ReconnectConfig};
use crate::registry::SubscriptionRegistry;
use transport::{redact, FrameStream, Transport};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Credential ──────────────────────────────────────────────────────

/// Bearer credential of the logged-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self { user_id, token: token.into() }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"***")
            .finish()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Current state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Whether the channel is still trying to deliver live updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveUpdates {
    Available,
    /// Reconnect attempts were exhausted; only a new `connect` revives it.
    Unavailable,
}

// ── Reconnection policy ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt + 1`: `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ── Endpoint ────────────────────────────────────────────────────────

/// Build `{ws|wss}://{host}{path}?token={bearer}` for a credential.
///
/// Plaintext `ws` is allowed only for loopback hosts.
pub fn endpoint_url(config: &RealtimeConfig, credential: &Credential) -> Result<Url> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(anyhow!("realtime host must not be empty"));
    }
    let loopback = is_loopback_host(host_without_port(host));
    let secure = config.secure.unwrap_or(!loopback);
    if !secure && !loopback {
        return Err(anyhow!("realtime endpoint must use wss (ws is allowed only for localhost)"));
    }

    let scheme = if secure { "wss" } else { "ws" };
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    let mut url = Url::parse(&format!("{scheme}://{host}{path}"))
        .with_context(|| format!("invalid realtime endpoint for host `{host}`"))?;
    url.query_pairs_mut().append_pair("token", &credential.token);
    Ok(url)
}

fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

// ── Connection manager ──────────────────────────────────────────────

struct ChannelTask {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Manages the push channel lifecycle.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    config: RealtimeConfig,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    live_tx: Arc<watch::Sender<LiveUpdates>>,
    epoch: Arc<AtomicU64>,
    channel: Option<ChannelTask>,
}

impl ConnectionManager {
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        registry: SubscriptionRegistry,
    ) -> Self {
        let policy = ReconnectPolicy::from(&config.reconnect);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (live_tx, _) = watch::channel(LiveUpdates::Available);
        Self {
            transport,
            registry,
            config,
            policy,
            state_tx: Arc::new(state_tx),
            live_tx: Arc::new(live_tx),
            epoch: Arc::new(AtomicU64::new(0)),
            channel: None,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn live_updates_available(&self) -> bool {
        *self.live_tx.borrow() == LiveUpdates::Available
    }

    pub fn watch_live_updates(&self) -> watch::Receiver<LiveUpdates> {
        self.live_tx.subscribe()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Open the channel for `credential`, replacing any existing channel.
    ///
    /// Returns once the channel task is running; the outcome of the first
    /// attempt is observable through [`Self::watch_state`].
    pub async fn connect(&mut self, credential: &Credential) -> Result<()> {
        let endpoint = endpoint_url(&self.config, credential)?;
        self.teardown().await;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.live_tx.send_replace(LiveUpdates::Available);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let context = ChannelContext {
            epoch,
            current_epoch: Arc::clone(&self.epoch),
            endpoint,
            transport: Arc::clone(&self.transport),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            state_tx: Arc::clone(&self.state_tx),
            live_tx: Arc::clone(&self.live_tx),
        };
        debug!(epoch, user_id = credential.user_id, "starting realtime channel");
        let task = tokio::spawn(run_channel(context, shutdown_rx));
        self.channel = Some(ChannelTask { shutdown_tx, task });
        Ok(())
    }

    /// Close the channel with a normal-closure status and cancel any
    /// pending reconnect. No attempt is made after this returns.
    pub async fn teardown(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = self.channel.take() {
            let _ = channel.shutdown_tx.send(());
            if let Err(error) = channel.task.await {
                if !error.is_cancelled() {
                    warn!(?error, "realtime channel task failed");
                }
            }
            info!("realtime channel torn down");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = self.channel.take() {
            let _ = channel.shutdown_tx.send(());
            channel.task.abort();
        }
    }
}

// ── Channel task ────────────────────────────────────────────────────

struct ChannelContext {
    epoch: u64,
    current_epoch: Arc<AtomicU64>,
    endpoint: Url,
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    live_tx: Arc<watch::Sender<LiveUpdates>>,
}

impl ChannelContext {
    fn is_current(&self) -> bool {
        self.current_epoch.load(Ordering::SeqCst) == self.epoch
    }

    fn set_state(&self, state: ConnectionState) {
        if self.is_current() {
            self.state_tx.send_replace(state);
        }
    }
}

enum ChannelEnd {
    Teardown,
    Closed(String),
}

async fn run_channel(context: ChannelContext, mut shutdown: broadcast::Receiver<()>) {
    let mut attempt: u32 = 0;
    loop {
        context.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            _ = shutdown.recv() => return,
            opened = context.transport.open(&context.endpoint) => opened,
        };

        match opened {
            Ok(mut stream) => {
                attempt = 0;
                context.set_state(ConnectionState::Connected);
                info!(endpoint = %redact(&context.endpoint), "realtime channel connected");
                match pump(&context, stream.as_mut(), &mut shutdown).await {
                    ChannelEnd::Teardown => {
                        if tokio::time::timeout(CLOSE_TIMEOUT, stream.close()).await.is_err() {
                            debug!("timed out closing realtime channel");
                        }
                        return;
                    }
                    ChannelEnd::Closed(reason) => warn!(%reason, "realtime channel closed"),
                }
            }
            Err(error) => warn!(error = %format!("{error:#}"), "realtime channel failed to open"),
        }

        if !context.is_current() {
            return;
        }
        if attempt >= context.policy.max_attempts {
            context.set_state(ConnectionState::Disconnected);
            context.live_tx.send_replace(LiveUpdates::Unavailable);
            warn!(attempts = attempt, "reconnect attempts exhausted; live updates unavailable");
            return;
        }

        let delay = context.policy.delay_for(attempt);
        attempt += 1;
        context.set_state(ConnectionState::Reconnecting { attempt });
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if !context.is_current() {
            debug!(attempt, "discarding reconnect timer from a stale credential");
            return;
        }
    }
}

async fn pump(
    context: &ChannelContext,
    stream: &mut dyn FrameStream,
    shutdown: &mut broadcast::Receiver<()>,
) -> ChannelEnd {
    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return ChannelEnd::Teardown,
            frame = stream.recv() => frame,
        };
        match frame {
            Some(Ok(text)) => {
                dispatch_frame(&context.registry, &text);
            }
            Some(Err(error)) => return ChannelEnd::Closed(format!("{error:#}")),
            None => return ChannelEnd::Closed("closed by server".to_string()),
        }
    }
}

/// Decode one inbound frame and publish it. Malformed frames are dropped.
/// Returns the number of subscribers reached.
pub fn dispatch_frame(registry: &SubscriptionRegistry, frame: &str) -> usize {
    match EventEnvelope::decode(frame) {
        Ok(envelope) => {
            trace!(event_type = %envelope.event_type, "dispatching push event");
            registry.publish(&envelope.event_type, &envelope.data)
        }
        Err(error) => {
            warn!(%error, len = frame.len(), "dropping malformed frame");
            0
        }
    }
}
