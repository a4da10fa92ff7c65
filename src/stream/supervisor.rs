/**
 * Connection Supervisor
 *
 * Keeps one logical streaming connection alive. Failures, remote closes and
 * silence all feed the same capped exponential backoff loop; callers only ever
 * see `ConnectionStatus` transitions and inbound data frames.
 */
use super::config::{OUTBOUND_CHANNEL_CAPACITY, SupervisorConfig};
use super::policy::Backoff;
use super::status::{ConnectionStatus, HandlerId};
use super::transport::{Connection, Frame, Transport};
use crate::error::{Error, Result};
use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::any::Any;
use std::num::NonZeroU32;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type MessageHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(ConnectionStatus, ConnectionStatus) + Send + Sync>;

/// State shared between the supervisor handle and its background task
struct Shared {
    status_tx: watch::Sender<ConnectionStatus>,
    /// Serializes transitions so status handlers observe them in order
    transition_lock: Mutex<()>,
    message_handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    status_handlers: RwLock<Vec<(HandlerId, StatusHandler)>>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Shared {
    fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            status_tx,
            transition_lock: Mutex::new(()),
            message_handlers: RwLock::new(Vec::new()),
            status_handlers: RwLock::new(Vec::new()),
            outbound: Mutex::new(None),
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn transition(&self, next: ConnectionStatus) {
        let _guard = self
            .transition_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.status_tx.send_replace(next);
        if previous == next {
            return;
        }
        info!("🔌 Connection {} → {}", previous, next);

        let handlers: Vec<StatusHandler> = self
            .status_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(previous, next))) {
                error!("💥 Status handler panicked: {}", panic_reason(&*panic));
            }
        }
    }

    /// Hands a data frame to every message handler in registration order.
    /// Stops at the first handler that panics and returns its panic message.
    fn dispatch(&self, payload: &Bytes) -> core::result::Result<(), String> {
        let handlers: Vec<MessageHandler> = self
            .message_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                let reason = panic_reason(&*panic);
                error!("💥 Message handler panicked: {}", reason);
                return Err(reason);
            }
        }
        Ok(())
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<Bytes>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn outbound(&self) -> Option<mpsc::Sender<Bytes>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct SessionContext {
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    shared: Shared,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    Failed(String),
}

/// Owns one logical streaming connection and reconnects it without caller
/// intervention
pub struct ConnectionSupervisor {
    ctx: Arc<SessionContext>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: SupervisorConfig) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                transport,
                config,
                shared: Shared::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.ctx.config
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.ctx.shared.status()
    }

    /// Async view of the status. Intermediate states may be coalesced here;
    /// use `on_status_change` to see every transition.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.ctx.shared.status_tx.subscribe()
    }

    /// Connects and starts supervising. Returns once the first handshake has
    /// either succeeded (`Connected`) or failed (`Retrying`). A no-op while
    /// already connecting, connected or retrying.
    pub async fn start(&self) -> ConnectionStatus {
        let mut lifecycle = self.lifecycle.lock().await;

        if lifecycle
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            debug!("Supervisor already running ({})", self.status());
            return self.status();
        }

        let ctx = self.ctx.clone();
        let cancel = CancellationToken::new();
        let mut backoff = ctx.config.policy.backoff();

        ctx.shared.transition(ConnectionStatus::Connecting);
        let connection = match Self::connect_once(&ctx).await {
            Ok(connection) => {
                backoff.reset();
                ctx.shared.transition(ConnectionStatus::Connected);
                Some(connection)
            }
            Err(e) => {
                warn!("❌ Initial connect failed: {}", e);
                ctx.shared.transition(ConnectionStatus::Retrying);
                None
            }
        };

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            Self::run(ctx, task_cancel, backoff, connection).await;
        });
        *lifecycle = Some(Running { cancel, handle });

        self.status()
    }

    /// Cancels any pending reconnect, closes the transport and goes
    /// `Disconnected`. Nothing reconnects after this returns.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the supervisor task itself. Handler panics are
    /// caught on the task and never reach here.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(running) = lifecycle.take() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
            info!("🛑 Supervisor stopped");
        }
        self.ctx.shared.transition(ConnectionStatus::Disconnected);
    }

    /// Registers a handler for inbound data frames. Handlers run in registration
    /// order on the supervisor task and must not block. A handler that panics
    /// ends the current session, which then goes `Retrying`.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        let id = HandlerId::new();
        let handler: MessageHandler = Arc::new(handler);
        self.ctx
            .shared
            .message_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Registers a handler called with `(previous, next)` on every transition.
    /// Handlers must not call `start` or `stop` synchronously.
    pub fn on_status_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ConnectionStatus, ConnectionStatus) + Send + Sync + 'static,
    {
        let id = HandlerId::new();
        let handler: StatusHandler = Arc::new(handler);
        self.ctx
            .shared
            .status_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Returns whether a handler with this id was registered
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let shared = &self.ctx.shared;
        let mut removed = false;

        let mut messages = shared
            .message_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = messages.len();
        messages.retain(|(handler_id, _)| *handler_id != id);
        removed |= messages.len() != before;
        drop(messages);

        let mut statuses = shared
            .status_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = statuses.len();
        statuses.retain(|(handler_id, _)| *handler_id != id);
        removed |= statuses.len() != before;

        removed
    }

    /// Queues an outbound frame on the live session
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` if there is no live session
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let sender = self.ctx.shared.outbound().ok_or(Error::NotConnected)?;
        sender.send(payload).await.map_err(|_| Error::NotConnected)
    }

    async fn connect_once(ctx: &SessionContext) -> Result<Box<dyn Connection>> {
        let limit = ctx.config.connect_timeout;
        match timeout(limit, ctx.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "handshake timed out after {limit:?}"
            ))),
        }
    }

    /// Supervisor loop: run the session while connected, back off and reconnect
    /// otherwise. Returns on cancellation or when the attempt ceiling is hit.
    async fn run(
        ctx: Arc<SessionContext>,
        cancel: CancellationToken,
        mut backoff: Backoff,
        mut connection: Option<Box<dyn Connection>>,
    ) {
        let mut rng = StdRng::from_entropy();
        let mut failures: u32 = u32::from(connection.is_none());

        loop {
            if let Some(conn) = connection.take() {
                match Self::run_session(&ctx, &cancel, conn).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Failed(reason) => {
                        warn!("⚠️  Connection lost: {}", reason);
                        backoff.reset();
                        failures = 0;
                        ctx.shared.transition(ConnectionStatus::Retrying);
                    }
                }
            }

            if let Some(max) = ctx.config.max_attempts.map(NonZeroU32::get) {
                if failures >= max {
                    error!(
                        "❌ Giving up after {} consecutive failed connect attempts",
                        failures
                    );
                    ctx.shared.transition(ConnectionStatus::Disconnected);
                    return;
                }
            }

            let delay = backoff.next_delay(&mut rng);
            info!(
                "⏳ Reconnecting in {:?} (backoff step {}, {} failed attempts)",
                delay,
                backoff.attempt(),
                failures
            );
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(delay) => {}
            }

            ctx.shared.transition(ConnectionStatus::Connecting);
            let attempt = tokio::select! {
                () = cancel.cancelled() => return,
                result = Self::connect_once(&ctx) => result,
            };

            match attempt {
                Ok(conn) => {
                    backoff.reset();
                    failures = 0;
                    ctx.shared.transition(ConnectionStatus::Connected);
                    connection = Some(conn);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("❌ Connect attempt {} failed: {}", failures, e);
                    ctx.shared.transition(ConnectionStatus::Retrying);
                }
            }
        }
    }

    async fn run_session(
        ctx: &SessionContext,
        cancel: &CancellationToken,
        mut conn: Box<dyn Connection>,
    ) -> SessionEnd {
        let silence_timeout = ctx.config.silence_timeout;
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        ctx.shared.set_outbound(Some(outbound_tx));

        let silence = sleep(silence_timeout);
        tokio::pin!(silence);
        let mut ping = ctx.config.ping_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => break SessionEnd::Cancelled,
                () = &mut silence => {
                    break SessionEnd::Failed(format!("no frame received for {silence_timeout:?}"));
                }
                Some(payload) = outbound_rx.recv() => {
                    if let Err(e) = conn.send(payload).await {
                        break SessionEnd::Failed(format!("send failed: {e}"));
                    }
                }
                () = next_ping(&mut ping) => {
                    if let Err(e) = conn.ping().await {
                        break SessionEnd::Failed(format!("ping failed: {e}"));
                    }
                }
                frame = conn.recv() => match frame {
                    Some(Ok(frame)) => {
                        silence.as_mut().reset(Instant::now() + silence_timeout);
                        match frame {
                            Frame::Data(payload) => {
                                if let Err(reason) = ctx.shared.dispatch(&payload) {
                                    let reason = format!("message handler panicked: {reason}");
                                    break SessionEnd::Failed(reason);
                                }
                            }
                            Frame::KeepAlive => debug!("💓 Keep-alive"),
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(format!("receive failed: {e}")),
                    None => break SessionEnd::Failed("remote closed the stream".to_string()),
                },
            }
        };

        ctx.shared.set_outbound(None);
        if let Err(e) = conn.close().await {
            debug!("Close after session end failed: {}", e);
        }
        end
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
