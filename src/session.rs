//! Tunnel session: one transport connection and the loops that drive it
//!
//! A session owns a [`MessageSink`]/[`MessageStream`] pair and runs three
//! concurrent tasks over it:
//!
//! - **keepalive**: pings the peer on a fixed interval under a deadline
//! - **reader**: hands every inbound message to an [`InboundHandler`]
//! - **writer**: drains the bounded outbound queue under a write deadline
//!
//! ```text
//!            submit()                         on_inbound()
//! producers ──────────▶ [queue] ──▶ writer ──▶ sink   stream ──▶ reader ──▶ handler
//!                                     ▲                              │
//!                         keepalive ──┘        Outbound ◀────────────┘
//! ```
//!
//! The first loop that fails moves the session from `Open` to `Closing`. Every
//! loop watches the state channel and stops as soon as it changes. A teardown
//! task then closes the transport exactly once and publishes `Closed`. A closed
//! session is never reopened; owners build a new one instead.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::error::SubmitError;
use crate::transport::{MessageSink, MessageStream};

/// Payload of keepalive pings
const PING_PAYLOAD: [u8; 1] = [0x00];

/// Session lifecycle. Sessions start over an established transport, so the
/// first state is `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// All loops running
    Open,
    /// A loop failed or shutdown was requested; loops are stopping
    Closing,
    /// Transport closed; the session is spent
    Closed,
}

/// Receives every inbound message of a session, in arrival order.
///
/// The reader loop awaits this call before reading the next message, so an
/// implementation can apply backpressure by waiting here. Long work belongs in
/// a spawned task.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_inbound(&self, message: Vec<u8>, outbound: &Outbound);
}

/// Cloneable handle to a session's outbound queue
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Outbound {
    /// Create a detached queue, e.g. to drive a handler without a session
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a message without waiting. A full queue drops the message.
    pub fn submit(&self, message: Vec<u8>) -> Result<(), SubmitError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

/// Handle to a running tunnel session
pub struct TunnelSession {
    label: Arc<str>,
    outbound: Outbound,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
}

impl TunnelSession {
    /// Start the session loops over an established transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<W, R, H>(
        label: impl Into<String>,
        sink: W,
        stream: R,
        handler: H,
        config: &SessionConfig,
    ) -> Self
    where
        W: MessageSink,
        R: MessageStream,
        H: InboundHandler,
    {
        let label: Arc<str> = Arc::from(label.into());
        let (state_tx, state_rx) = watch::channel(SessionState::Open);
        let state_tx = Arc::new(state_tx);
        let (outbound, outbound_rx) = Outbound::channel(config.queue_capacity);
        let sink = Arc::new(Mutex::new(sink));

        log::debug!("{}: session open", label);

        let keepalive = tokio::spawn(keepalive_loop(
            label.clone(),
            sink.clone(),
            state_tx.clone(),
            config.keepalive_interval,
            config.ping_timeout,
        ));
        let reader = tokio::spawn(reader_loop(
            label.clone(),
            stream,
            handler,
            outbound.clone(),
            state_tx.clone(),
        ));
        let writer = tokio::spawn(writer_loop(
            label.clone(),
            sink.clone(),
            outbound_rx,
            state_tx.clone(),
            config.write_timeout,
        ));

        tokio::spawn(teardown(
            label.clone(),
            sink,
            state_tx.clone(),
            [("keepalive", keepalive), ("reader", reader), ("writer", writer)],
            config.write_timeout,
        ));

        Self {
            label,
            outbound,
            state_tx,
            state_rx,
        }
    }

    /// Human readable session label used in log lines
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Enqueue a message for the writer loop
    pub fn submit(&self, message: Vec<u8>) -> Result<(), SubmitError> {
        if self.state() != SessionState::Open {
            return Err(SubmitError::Closed);
        }
        self.outbound.submit(message)
    }

    /// Request teardown. Has no effect once the session is already closing.
    pub fn shutdown(&self) {
        if begin_closing(&self.state_tx) {
            log::debug!("{}: shutdown requested", self.label);
        }
    }

    /// Wait until the transport has been closed
    pub async fn closed(&self) {
        let mut state = self.state_tx.subscribe();
        loop {
            if *state.borrow_and_update() == SessionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Move `Open -> Closing`. Returns false if some other party got there first.
fn begin_closing(state: &watch::Sender<SessionState>) -> bool {
    state.send_if_modified(|current| {
        if *current == SessionState::Open {
            *current = SessionState::Closing;
            true
        } else {
            false
        }
    })
}

/// Resolves once the session has left `Open`
async fn wait_closing(state: &mut watch::Receiver<SessionState>) {
    loop {
        if *state.borrow_and_update() != SessionState::Open {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn keepalive_loop<W: MessageSink>(
    label: Arc<str>,
    sink: Arc<Mutex<W>>,
    state: Arc<watch::Sender<SessionState>>,
    period: Duration,
    ping_timeout: Duration,
) {
    let mut quit = state.subscribe();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_closing(&mut quit) => return,
            _ = ticker.tick() => {}
        }

        let ping = async { sink.lock().await.send_ping(PING_PAYLOAD.to_vec()).await };
        let result = tokio::select! {
            _ = wait_closing(&mut quit) => return,
            result = timeout(ping_timeout, ping) => result,
        };

        match result {
            Ok(Ok(())) => log::debug!("{}: keepalive ping sent", label),
            Ok(Err(e)) => {
                log::warn!("{}: fail to ping tunnel peer: {}", label, e);
                begin_closing(&state);
                return;
            }
            Err(_) => {
                log::warn!("{}: keepalive ping timed out after {:?}", label, ping_timeout);
                begin_closing(&state);
                return;
            }
        }
    }
}

async fn reader_loop<R: MessageStream, H: InboundHandler>(
    label: Arc<str>,
    mut stream: R,
    handler: H,
    outbound: Outbound,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut quit = state.subscribe();

    loop {
        let result = tokio::select! {
            _ = wait_closing(&mut quit) => return,
            result = stream.next_message() => result,
        };

        match result {
            Ok(Some(message)) => {
                tokio::select! {
                    _ = wait_closing(&mut quit) => return,
                    _ = handler.on_inbound(message, &outbound) => {}
                }
            }
            Ok(None) => {
                log::info!("{}: tunnel closed by peer", label);
                begin_closing(&state);
                return;
            }
            Err(e) => {
                log::warn!("{}: error reading from tunnel: {}", label, e);
                begin_closing(&state);
                return;
            }
        }
    }
}

async fn writer_loop<W: MessageSink>(
    label: Arc<str>,
    sink: Arc<Mutex<W>>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    state: Arc<watch::Sender<SessionState>>,
    write_timeout: Duration,
) {
    let mut quit = state.subscribe();

    loop {
        let message = tokio::select! {
            _ = wait_closing(&mut quit) => return,
            message = queue.recv() => message,
        };

        let Some(message) = message else {
            // every producer handle is gone, nothing can be sent anymore
            begin_closing(&state);
            return;
        };

        let len = message.len();
        let write = async { sink.lock().await.send_message(message).await };
        let result = tokio::select! {
            _ = wait_closing(&mut quit) => return,
            result = timeout(write_timeout, write) => result,
        };

        match result {
            Ok(Ok(())) => log::trace!("{}: wrote {} bytes", label, len),
            Ok(Err(e)) => {
                log::warn!("{}: error writing message to tunnel: {}", label, e);
                begin_closing(&state);
                return;
            }
            Err(_) => {
                log::warn!("{}: tunnel write timed out after {:?}", label, write_timeout);
                begin_closing(&state);
                return;
            }
        }
    }
}

async fn teardown<W: MessageSink>(
    label: Arc<str>,
    sink: Arc<Mutex<W>>,
    state: Arc<watch::Sender<SessionState>>,
    loops: [(&'static str, JoinHandle<()>); 3],
    close_timeout: Duration,
) {
    for (name, handle) in loops {
        if let Err(e) = handle.await {
            log::error!("{}: {} loop aborted: {}", label, name, e);
            begin_closing(&state);
        }
    }

    // all loops have returned, so the sink has no other user
    match timeout(close_timeout, async { sink.lock().await.close().await }).await {
        Ok(Ok(())) => log::debug!("{}: tunnel connection closed", label),
        Ok(Err(e)) => log::debug!("{}: error closing tunnel connection: {}", label, e),
        Err(_) => log::debug!("{}: timed out closing tunnel connection", label),
    }

    state.send_replace(SessionState::Closed);
    log::info!("{}: session closed", label);
}
