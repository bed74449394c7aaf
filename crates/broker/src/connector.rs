//! Broker connection supervisor.
//!
//! [`BrokerConnector`] owns the one connection and channel a process keeps
//! to the broker. A supervised task connects, sets the channel up
//! (exchange, queue, binding, QoS, confirm mode), hands the resulting
//! [`Session`] to registered [`SessionHook`]s, and waits for the session to
//! be lost. Unless [`BrokerConnector::stop`] was called it then reconnects
//! with the delays from [`crate::reconnect`], giving up after
//! `max_attempts` consecutive failures.
//!
//! ```text
//! Disconnected ──> Connecting ──> Open ──> Closing ──> Closed
//!       ^              │           │
//!       └──────────────┴───────────┘  (lost / failed, reconnect)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::events::{BrokerEvent, StopReason};
use crate::reconnect::{attempts_exhausted, next_delay};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Confirmation, QueueOptions, TransportError,
};

/// Broadcast channel capacity for connector events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `stop()` waits for the supervised task and for hooks.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Final outcome of the supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Stopped,
    Exhausted { attempts: u32 },
}

/// One connected channel. Replaced on every reconnect.
pub struct Session {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    confirm_mode: bool,
    confirms: Mutex<Option<mpsc::UnboundedReceiver<Confirmation>>>,
    activity: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("confirm_mode", &self.confirm_mode)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Sessions opened since the connector started, this one included.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn confirm_mode(&self) -> bool {
        self.confirm_mode
    }

    /// The publisher-confirm stream of this channel. Yields `Some` once.
    pub fn take_confirms(&self) -> Option<mpsc::UnboundedReceiver<Confirmation>> {
        self.confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Note that a message was published or consumed, so the next
    /// reconnect happens without delay.
    pub fn record_activity(&self) {
        self.activity.store(true, Ordering::Relaxed);
    }
}

/// Callbacks run as sessions come and go.
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// Called for every new session before it is published to callers.
    /// An error abandons the session and counts as a failed attempt.
    async fn session_opened(&self, session: Arc<Session>) -> Result<(), BrokerError>;

    /// Called by `stop()` before the channel is closed.
    async fn session_closing(&self, _session: &Session) {}
}

/// Identifies a registered hook for [`BrokerConnector::remove_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

pub struct BrokerConnector {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<Arc<Session>>>,
    outcome_tx: watch::Sender<Option<Outcome>>,
    hooks: tokio::sync::Mutex<Vec<(HookId, Arc<dyn SessionHook>)>>,
    next_hook: AtomicU64,
    activity: Arc<AtomicBool>,
    stopping: AtomicBool,
    event_tx: broadcast::Sender<BrokerEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnector {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BrokerConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            config,
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            session_tx: watch::Sender::new(None),
            outcome_tx: watch::Sender::new(None),
            hooks: tokio::sync::Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            activity: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            event_tx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the supervised connection task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            tracing::info!(url = %redact(&this.config.url), "Starting broker connector");
            let outcome = this.run().await;
            if outcome != Outcome::Stopped {
                this.finish(outcome);
            }
            tracing::info!("Broker connector task exited");
        }));
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The open session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session_tx.borrow().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }

    /// Wait until a session is open.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Arc<Session>, BrokerError> {
        let mut rx = self.state_tx.subscribe();
        let state = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed)),
        )
        .await
        .map_err(|_| BrokerError::Timeout)?
        .map(|s| *s)
        .map_err(|_| BrokerError::Stopped)?;

        if state == ConnectionState::Closed {
            return match self.wait_stopped().await {
                Err(e) => Err(e),
                Ok(()) => Err(BrokerError::Stopped),
            };
        }
        self.session().ok_or(BrokerError::NotConnected)
    }

    /// Wait until the connector is closed for good.
    ///
    /// Returns `Err(AttemptsExhausted)` when it gave up reconnecting.
    pub async fn wait_stopped(&self) -> Result<(), BrokerError> {
        let mut rx = self.outcome_tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|o| *o)
            .map_err(|_| BrokerError::Stopped)?;
        match outcome {
            Some(Outcome::Exhausted { attempts }) => {
                Err(BrokerError::AttemptsExhausted { attempts })
            }
            _ => Ok(()),
        }
    }

    /// Register a hook. If a session is already open the hook is run for it
    /// right away.
    pub async fn add_hook(&self, hook: Arc<dyn SessionHook>) -> HookId {
        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        let mut hooks = self.hooks.lock().await;
        if let Some(session) = self.session() {
            if let Err(e) = hook.session_opened(Arc::clone(&session)).await {
                tracing::warn!(error = %e, generation = session.generation, "Session hook failed");
                self.report_channel_error(&session, "session hook failed").await;
            }
        }
        hooks.push((id, hook));
        id
    }

    pub async fn remove_hook(&self, id: HookId) {
        self.hooks.lock().await.retain(|(hook_id, _)| *hook_id != id);
    }

    /// Close `session`'s channel after an unrecoverable channel-level
    /// problem. The supervisor then reconnects unless stopping.
    pub async fn report_channel_error(&self, session: &Session, reason: &str) {
        tracing::warn!(generation = session.generation, reason, "Closing broker channel");
        if let Err(e) = session.channel.close().await {
            tracing::debug!(error = %e, "Channel close failed");
        }
    }

    /// Close the session and disable reconnection permanently.
    ///
    /// Hooks get to cancel their consumers first; the supervised task is
    /// then given up to 5 seconds to exit.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let _ = self.wait_stopped().await;
            return;
        }
        tracing::info!("Stopping broker connector");
        self.state_tx.send_replace(ConnectionState::Closing);

        if let Some(session) = self.session_tx.send_replace(None) {
            let hooks: Vec<Arc<dyn SessionHook>> =
                self.hooks.lock().await.iter().map(|(_, h)| Arc::clone(h)).collect();
            for hook in hooks {
                hook.session_closing(&session).await;
            }
            if let Err(e) = session.channel.close().await {
                tracing::debug!(error = %e, "Channel close failed");
            }
            if let Err(e) = session.connection.close().await {
                tracing::debug!(error = %e, "Connection close failed");
            }
        }

        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Broker connector task did not exit in time");
            }
        }

        self.finish(Outcome::Stopped);
        tracing::info!("Broker connector stopped");
    }

    // ---- private helpers ----

    /// Record the final outcome once, move to `Closed` and announce it.
    fn finish(&self, outcome: Outcome) {
        self.session_tx.send_replace(None);
        if self.outcome_tx.borrow().is_none() {
            let reason = match outcome {
                Outcome::Stopped => StopReason::Requested,
                Outcome::Exhausted { .. } => StopReason::AttemptsExhausted,
            };
            let _ = self.event_tx.send(BrokerEvent::Stopped { reason });
        }
        self.outcome_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Supervised loop: connect, serve the session, reconnect.
    async fn run(&self) -> Outcome {
        let policy = &self.config.reconnect;
        let mut delay = Duration::ZERO;
        let mut failures = 0u32;
        let mut generation = 0u64;
        let mut first = true;

        loop {
            if !first {
                let _ = self.event_tx.send(BrokerEvent::Reconnecting {
                    attempt: failures + 1,
                    delay_ms: delay.as_millis() as u64,
                });
                tracing::info!(
                    attempt = failures + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting to broker",
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Outcome::Stopped,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;
            if self.cancel.is_cancelled() || self.is_stopping() {
                return Outcome::Stopped;
            }

            self.state_tx.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stopped,
                result = self.establish(generation + 1) => result,
            };

            let session = match attempt {
                Ok(session) => session,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        attempt = failures,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    let _ = self.event_tx.send(BrokerEvent::ConnectAttemptFailed {
                        attempt: failures,
                        error: e.to_string(),
                    });
                    if attempts_exhausted(failures, policy) {
                        tracing::error!(attempts = failures, "Giving up connecting to broker");
                        return Outcome::Exhausted { attempts: failures };
                    }
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    delay = next_delay(delay, false, policy);
                    continue;
                }
            };

            failures = 0;
            generation = session.generation;
            if self.is_stopping() {
                return Outcome::Stopped;
            }
            self.state_tx.send_replace(ConnectionState::Open);
            let _ = self.event_tx.send(BrokerEvent::Connected { generation });
            tracing::info!(generation, "Broker session open");

            let reason = tokio::select! {
                _ = self.cancel.cancelled() => None,
                _ = session.connection.closed() => Some("connection closed"),
                _ = session.channel.closed() => Some("channel closed"),
            };
            let Some(reason) = reason else {
                return Outcome::Stopped;
            };
            if self.is_stopping() {
                return Outcome::Stopped;
            }

            tracing::warn!(generation, reason, "Broker session lost");
            self.session_tx.send_replace(None);
            self.state_tx.send_replace(ConnectionState::Disconnected);
            let _ = self.event_tx.send(BrokerEvent::Disconnected {
                generation,
                reason: reason.to_string(),
            });
            if let Err(e) = session.connection.close().await {
                tracing::debug!(error = %e, "Connection close failed");
            }

            let had_activity = self.activity.swap(false, Ordering::Relaxed);
            delay = next_delay(delay, had_activity, policy);
        }
    }

    /// Connect, set the channel up, and run the hooks. The session is
    /// published only when every hook accepted it.
    async fn establish(&self, generation: u64) -> Result<Arc<Session>, BrokerError> {
        let connection: Arc<dyn BrokerConnection> = Arc::from(self.transport.connect().await?);
        let session = match self.open_channel(&connection, generation).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let _ = connection.close().await;
                return Err(e.into());
            }
        };

        let hooks = self.hooks.lock().await;
        for (_, hook) in hooks.iter() {
            if let Err(e) = hook.session_opened(Arc::clone(&session)).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        self.activity.store(false, Ordering::Relaxed);
        self.session_tx.send_replace(Some(Arc::clone(&session)));
        drop(hooks);
        Ok(session)
    }

    async fn open_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        generation: u64,
    ) -> Result<Session, TransportError> {
        let c = &self.config;
        let channel: Arc<dyn BrokerChannel> = Arc::from(connection.open_channel().await?);
        channel.exchange_declare(&c.exchange, c.exchange_kind, true).await?;
        channel
            .queue_declare(
                &c.queue,
                QueueOptions {
                    durable: true,
                    ..Default::default()
                },
            )
            .await?;
        channel.queue_bind(&c.queue, &c.exchange, &c.routing_key).await?;
        channel.basic_qos(c.prefetch_count).await?;
        let confirms = if c.confirm {
            Some(channel.confirm_select().await?)
        } else {
            None
        };

        Ok(Session {
            generation,
            connection: Arc::clone(connection),
            channel,
            confirm_mode: confirms.is_some(),
            confirms: Mutex::new(confirms),
            activity: Arc::clone(&self.activity),
        })
    }
}

/// Strip credentials from an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
