//! Gateway session: connect, handshake, heartbeat, resume, dispatch
//!
//! One logical session runs three cooperatively suspending loops over a
//! shared transport: the receive loop (sole mutator of the sequence number
//! and session id), the send loop (sole transport writer, draining the
//! outbound queue FIFO), and the heartbeat loop. Reconnects are guarded by a
//! single in-progress flag so the receive loop and the heartbeat timeout
//! detector never both initiate one.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use perch_registry::{EventRegistry, LayerId};

use crate::protocol::{EventCode, Hello, Opcode, Payload, dispatch};
use crate::transport::{Connector, FrameReceiver, FrameSender, TransportError};

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Connected,
    Disconnected,
}

/// Connection parameters for one session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: Url,
    pub token: String,
    /// Subscription mask sent with identify.
    pub intents: u64,
    /// Hard ceiling on one handler-chain invocation. `None` lets in-flight
    /// handlers run to completion.
    pub handler_timeout: Option<Duration>,
}

/// State shared across the three loops. The receive loop is the only writer
/// of `seq` and `session_id`; atomics and short-lived locks publish the
/// values to the other loops.
pub struct SessionShared {
    seq: AtomicI64,
    session_id: RwLock<Option<String>>,
    heartbeat_acked: AtomicBool,
    reconnecting: AtomicBool,
    state: RwLock<SessionState>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            seq: AtomicI64::new(-1),
            session_id: RwLock::new(None),
            heartbeat_acked: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            state: RwLock::new(SessionState::Disconnected),
        }
    }

    /// Sequence number of the last received event, if any.
    pub fn seq(&self) -> Option<u64> {
        let raw = self.seq.load(Ordering::SeqCst);
        (raw >= 0).then_some(raw as u64)
    }

    /// Monotonically non-decreasing while connected.
    fn record_seq(&self, seq: u64) {
        self.seq.fetch_max(seq as i64, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().expect("session id lock poisoned").clone()
    }

    fn set_session_id(&self, id: String) {
        *self.session_id.write().expect("session id lock poisoned") = Some(id);
    }

    /// Reset to a fresh, never-identified session.
    fn clear_resume_state(&self) {
        self.seq.store(-1, Ordering::SeqCst);
        *self.session_id.write().expect("session id lock poisoned") = None;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Claim the right to initiate a reconnect. Only the first caller per
    /// connection wins.
    fn begin_reconnect(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::SeqCst)
    }
}

/// Why a connection attempt ended.
enum Disconnect {
    /// Recoverable: reconnect and resume with the held session id and seq.
    Resume,
    /// The session is invalid: clear held state and identify from scratch.
    Reidentify,
    /// Unrecoverable: tear the session down and report to the host.
    Fatal(anyhow::Error),
    /// The host asked the session to stop.
    Stopped,
}

type PendingDisconnect = Arc<Mutex<Option<Disconnect>>>;

/// Cloneable handle used by handlers and loops to enqueue outbound messages
/// and observe session state.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: Arc<RwLock<mpsc::UnboundedSender<Payload>>>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue a message for the send loop. Messages queued while no
    /// connection is up are dropped with a notice.
    pub fn send(&self, payload: Payload) {
        let sender = self.outbound.read().expect("outbound lock poisoned").clone();
        if sender.send(payload).is_err() {
            debug!("dropping outbound message: no connection");
        }
    }

    pub fn seq(&self) -> Option<u64> {
        self.shared.seq()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Stop the session: cancels all loops and closes the transport.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The connection/session state machine.
pub struct GatewaySession<C: Connector, Ctx> {
    config: GatewayConfig,
    connector: C,
    registry: Arc<EventRegistry<EventCode, Ctx>>,
    lineage: Vec<LayerId>,
    shared: Arc<SessionShared>,
    outbound: Arc<RwLock<mpsc::UnboundedSender<Payload>>>,
    cancel: CancellationToken,
}

impl<C, Ctx> GatewaySession<C, Ctx>
where
    C: Connector,
    Ctx: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: GatewayConfig,
        connector: C,
        registry: Arc<EventRegistry<EventCode, Ctx>>,
        lineage: Vec<LayerId>,
        cancel: CancellationToken,
    ) -> Self {
        // Placeholder queue until the first connection swaps in a live one.
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            registry,
            lineage,
            shared: Arc::new(SessionShared::new()),
            outbound: Arc::new(RwLock::new(tx)),
            cancel,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            outbound: Arc::clone(&self.outbound),
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        }
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    /// Run until stopped or torn down by an unrecoverable fault. Recoverable
    /// disconnects reconnect and resume in place; invalidated sessions
    /// re-identify from scratch.
    pub async fn run(&self, ctx: Ctx) -> anyhow::Result<()> {
        loop {
            match self.run_connection(&ctx).await {
                Disconnect::Stopped => {
                    self.shared.set_state(SessionState::Disconnected);
                    info!("session stopped");
                    return Ok(());
                }
                Disconnect::Resume => {
                    info!("connection lost; reconnecting with resume");
                }
                Disconnect::Reidentify => {
                    info!("session invalidated; reconnecting with a fresh identify");
                    self.shared.clear_resume_state();
                }
                Disconnect::Fatal(err) => {
                    self.shared.set_state(SessionState::Disconnected);
                    return Err(err);
                }
            }
        }
    }

    async fn run_connection(&self, ctx: &Ctx) -> Disconnect {
        self.shared.set_state(SessionState::Connecting);
        self.shared.reconnecting.store(false, Ordering::SeqCst);

        let (tx, mut rx) = match self.connector.connect(&self.config.endpoint).await {
            Ok(pair) => pair,
            Err(err) => {
                return Disconnect::Fatal(
                    anyhow!(err).context("failed to open gateway connection"),
                );
            }
        };

        // Handshake: the server opens with a hello carrying the heartbeat
        // cadence. Anything received before it is not addressable yet.
        self.shared.set_state(SessionState::AwaitingHello);
        let heartbeat_interval = loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return Disconnect::Stopped,
                received = rx.recv() => match received {
                    Ok(payload) => payload,
                    Err(err) => return classify(err),
                },
            };
            if payload.op == Opcode::Hello {
                match serde_json::from_value::<Hello>(payload.body()) {
                    Ok(hello) => break hello.heartbeat_interval,
                    Err(err) => {
                        return Disconnect::Fatal(anyhow!("malformed hello body: {err}"));
                    }
                }
            }
            debug!("ignoring pre-handshake frame {}", payload.code());
        };
        debug!("handshake received, heartbeat every {heartbeat_interval}ms");

        // Fresh outbound queue per connection; the send loop is the only
        // writer to the transport.
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.write().expect("outbound lock poisoned") = out_tx;
        let conn_cancel = self.cancel.child_token();
        let pending: PendingDisconnect = Arc::new(Mutex::new(None));

        let send_task = tokio::spawn(send_loop(
            tx,
            out_rx,
            conn_cancel.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&pending),
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            heartbeat_interval,
            self.handle(),
            Arc::clone(&self.shared),
            conn_cancel.clone(),
            Arc::clone(&pending),
        ));

        // Identify or resume, exactly once per handshake.
        self.shared.heartbeat_acked.store(true, Ordering::SeqCst);
        let handle = self.handle();
        match (self.shared.session_id(), self.shared.seq()) {
            (Some(session_id), seq @ Some(_)) => {
                self.shared.set_state(SessionState::Resuming);
                info!("resuming session {session_id}");
                handle.send(Payload::resume(&self.config.token, &session_id, seq));
            }
            _ => {
                self.shared.set_state(SessionState::Identifying);
                handle.send(Payload::identify(&self.config.token, self.config.intents));
            }
        }

        let outcome = self.receive_loop(ctx, &mut rx, &conn_cancel, &pending).await;

        conn_cancel.cancel();
        heartbeat_task.abort();
        let _ = send_task.await;
        outcome
    }

    async fn receive_loop(
        &self,
        ctx: &Ctx,
        rx: &mut C::Rx,
        conn_cancel: &CancellationToken,
        pending: &PendingDisconnect,
    ) -> Disconnect {
        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return Disconnect::Stopped,
                _ = conn_cancel.cancelled() => {
                    // Another loop initiated the reconnect and posted why.
                    return take_pending(pending);
                }
                received = rx.recv() => match received {
                    Ok(payload) => payload,
                    Err(err) => {
                        let outcome = classify(err);
                        if self.shared.begin_reconnect() {
                            return outcome;
                        }
                        return take_pending(pending);
                    }
                },
            };

            if let Some(seq) = payload.s {
                self.shared.record_seq(seq);
            }

            match payload.code() {
                EventCode::Control(Opcode::HeartbeatAck) => {
                    self.shared.heartbeat_acked.store(true, Ordering::SeqCst);
                    let code = EventCode::Control(Opcode::HeartbeatAck);
                    if let Err(err) = self.invoke_control(ctx, &code, payload.body()).await {
                        return Disconnect::Fatal(err.context("heartbeat-ack handler failed"));
                    }
                }
                EventCode::Control(Opcode::Heartbeat) => {
                    // The server may request an immediate beat.
                    self.handle().send(Payload::heartbeat(self.shared.seq()));
                }
                EventCode::Control(Opcode::Reconnect) => {
                    info!("server requested a reconnect");
                    if self.shared.begin_reconnect() {
                        return Disconnect::Resume;
                    }
                }
                EventCode::Control(Opcode::InvalidSession) => {
                    let resumable = payload.body().as_bool().unwrap_or(false);
                    warn!("server invalidated the session (resumable: {resumable})");
                    if self.shared.begin_reconnect() {
                        return if resumable {
                            Disconnect::Resume
                        } else {
                            Disconnect::Reidentify
                        };
                    }
                }
                EventCode::Control(Opcode::Hello) => {
                    debug!("ignoring duplicate hello");
                }
                code @ EventCode::Control(_) => {
                    // Control chains run inline: a slow handler here delays
                    // subsequent frames on purpose (backpressure), and a
                    // failing one aborts the connection attempt.
                    if let Err(err) = self.invoke_control(ctx, &code, payload.body()).await {
                        return Disconnect::Fatal(
                            err.context(format!("control handler for {code} failed")),
                        );
                    }
                }
                code @ EventCode::Dispatch(_) => {
                    // Resume state is captured here so the receive loop
                    // stays the sole writer of session id and state.
                    if code == EventCode::dispatch(dispatch::READY) {
                        if let Some(session_id) =
                            payload.body().get("session_id").and_then(Value::as_str)
                        {
                            self.shared.set_session_id(session_id.to_string());
                        }
                        self.shared.set_state(SessionState::Connected);
                    } else if code == EventCode::dispatch(dispatch::RESUMED) {
                        self.shared.set_state(SessionState::Connected);
                        info!("session resumed");
                    }
                    self.spawn_dispatch(ctx, code, payload.body());
                }
            }
        }
    }

    async fn invoke_control(
        &self,
        ctx: &Ctx,
        code: &EventCode,
        body: Value,
    ) -> anyhow::Result<()> {
        let Some(chain) = self.registry.resolve(code, &self.lineage) else {
            debug!("dropping frame with unhandled control code {code}");
            return Ok(());
        };
        let invocation = chain.invoke(ctx.clone(), body);
        match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("control handler chain for {code} exceeded {limit:?}, abandoned");
                    Ok(())
                }
            },
            None => invocation.await,
        }
    }

    /// Dispatch chains run off the receive loop so a slow consumer does not
    /// stall unrelated codes; failures are isolated to their own chain.
    fn spawn_dispatch(&self, ctx: &Ctx, code: EventCode, body: Value) {
        let Some(chain) = self.registry.resolve(&code, &self.lineage) else {
            debug!("unhandled event {code}");
            return;
        };
        let ctx = ctx.clone();
        let limit = self.config.handler_timeout;
        tokio::spawn(async move {
            let invocation = chain.invoke(ctx, body);
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("handler chain for {code} exceeded {limit:?}, abandoned");
                        return;
                    }
                },
                None => invocation.await,
            };
            if let Err(err) = result {
                warn!("handler chain for {code} failed: {err:#}");
            }
        });
    }
}

fn take_pending(pending: &PendingDisconnect) -> Disconnect {
    pending
        .lock()
        .expect("pending disconnect lock poisoned")
        .take()
        .unwrap_or(Disconnect::Resume)
}

/// Map a transport fault to its reconnect classification. Faults the wire
/// does not classify tear the session down.
fn classify(err: TransportError) -> Disconnect {
    match err {
        TransportError::Closed { resumable: true, .. } => Disconnect::Resume,
        TransportError::Closed { resumable: false, .. } => Disconnect::Reidentify,
        TransportError::Decode(err) => {
            warn!("reconnecting after frame decode failure: {err}");
            Disconnect::Resume
        }
        err @ (TransportError::Io(_) | TransportError::Connect(_)) => {
            Disconnect::Fatal(anyhow!(err).context("unclassifiable transport fault"))
        }
    }
}

/// Drains the outbound queue FIFO into the transport. The sole writer, so
/// concurrent producers can never interleave frames.
async fn send_loop<Tx: FrameSender>(
    mut tx: Tx,
    mut out_rx: mpsc::UnboundedReceiver<Payload>,
    conn_cancel: CancellationToken,
    shared: Arc<SessionShared>,
    pending: PendingDisconnect,
) {
    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            queued = out_rx.recv() => match queued {
                Some(payload) => {
                    if let Err(err) = tx.send(&payload).await {
                        warn!("failed to write frame: {err}");
                        if shared.begin_reconnect() {
                            *pending.lock().expect("pending disconnect lock poisoned") =
                                Some(Disconnect::Resume);
                        }
                        conn_cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    tx.close().await;
}

/// Every interval: require the previous beat was acknowledged, then send
/// the next one carrying the last received sequence number. A missing ack
/// means the connection is dead and forces exactly one reconnect.
async fn heartbeat_loop(
    interval_ms: u64,
    handle: SessionHandle,
    shared: Arc<SessionShared>,
    conn_cancel: CancellationToken,
    pending: PendingDisconnect,
) {
    let period = Duration::from_millis(interval_ms.max(1));
    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        if !shared.heartbeat_acked.swap(false, Ordering::SeqCst) {
            warn!("heartbeat not acknowledged within {period:?}; forcing reconnect");
            if shared.begin_reconnect() {
                *pending.lock().expect("pending disconnect lock poisoned") =
                    Some(Disconnect::Resume);
                conn_cancel.cancel();
            }
            return;
        }
        handle.send(Payload::heartbeat(shared.seq()));
    }
}
