//! # WebSocket Relay Handler
//!
//! Relays a client WebSocket to the upstream speech-to-text service.
//! Clients connect to `/ws` with whatever query parameters the upstream
//! expects; the relay adds the credential and never looks at the payload.
//!
//! ## Relay Protocol:
//! 1. **Connection**: Client connects, a session is registered in phase `probing`
//! 2. **Probe**: The upstream host is checked once; failure closes the client with 1002
//! 3. **Upstream**: The authenticated upstream socket is opened (`connecting`)
//! 4. **Relaying**: Frames flow both ways until either side terminates
//! 5. **Teardown**: The surviving side is closed and the session is retired
//!
//! ## Message Format:
//! - **Client → Upstream**: Forwarded unmodified (binary stays binary, text stays text)
//! - **Upstream → Client**: Always delivered as text frames

use crate::error::{AppError, AppResult, ConnectError};
use crate::relay::close::{self, ClientClose};
use crate::relay::probe::{ProbeReport, Prober};
use crate::relay::registry::SessionLease;
use crate::relay::session::{RelaySession, SessionPhase};
use crate::relay::upstream::{self, UpstreamSocket};
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::{Error as UpstreamError, Message as UpstreamMessage};
use tracing::{debug, info, warn};

/// Largest single frame accepted from a client.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Largest message reassembled from continuation frames.
const MAX_FRAGMENTED_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// How long the writer may spend delivering the close frame to an upstream
/// that has stopped reading before the socket is simply dropped.
const UPSTREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where and how to open the upstream socket for one session.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub credential: String,
    pub auth_scheme: String,
}

/// WebSocket actor owning one relay session.
///
/// ## Actor Model:
/// All events of a session (client frames, upstream frames, probe and
/// connect results) are handled by this actor one at a time, so the session
/// state is never shared and needs no locks.
pub struct RelaySocket {
    session: RelaySession,

    /// Shared with the upstream writer task; the session is retired when both are gone
    lease: Arc<SessionLease>,

    target: UpstreamTarget,
    prober: Prober,
    queue_capacity: usize,

    /// Bounded queue to the upstream writer. `None` until relaying and after teardown.
    upstream_tx: Option<mpsc::Sender<UpstreamMessage>>,

    /// Tells the writer to abandon its backlog and close the upstream now
    upstream_cancel: Option<oneshot::Sender<()>>,

    fragments: FragmentBuffer,

    /// Close frame the client was (or will be) sent, for the session log
    close: Option<ClientClose>,

    state: AppState,
}

impl RelaySocket {
    pub fn new(
        session: RelaySession,
        lease: SessionLease,
        target: UpstreamTarget,
        queue_capacity: usize,
        state: AppState,
    ) -> Self {
        Self {
            session,
            lease: Arc::new(lease),
            target,
            prober: state.prober.clone(),
            queue_capacity,
            upstream_tx: None,
            upstream_cancel: None,
            fragments: FragmentBuffer::default(),
            close: None,
            state,
        }
    }

    fn on_probe_finished(&mut self, report: ProbeReport, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.phase() != SessionPhase::Probing {
            return;
        }

        match &report.outcome {
            Err(err) => {
                self.state.record_probe_failure();
                warn!(
                    event = "session_probe_failed",
                    session_id = %self.session.id,
                    kind = err.kind(),
                    latency_ms = report.latency.as_millis() as u64,
                    error = %err,
                    "Upstream probe failed"
                );
                self.terminate(close::probe_failure(err), ctx);
            }
            Ok(_) => {
                debug!(session_id = %self.session.id, probe = %report.detail(), "Upstream reachable");
                if let Err(err) = self.session.transition(SessionPhase::Connecting) {
                    debug!(session_id = %self.session.id, "{}", err);
                    return;
                }

                let target = self.target.clone();
                let connect = async move {
                    upstream::connect(&target.url, &target.credential, &target.auth_scheme).await
                };
                ctx.spawn(
                    connect
                        .into_actor(self)
                        .map(|result, act, ctx| act.on_upstream_connected(result, ctx)),
                );
            }
        }
    }

    fn on_upstream_connected(
        &mut self,
        result: Result<UpstreamSocket, ConnectError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.session.phase() != SessionPhase::Connecting {
            // Client already gone; dropping the socket closes it
            return;
        }

        let socket = match result {
            Ok(socket) => socket,
            Err(err) => {
                self.state.record_connect_failure();
                warn!(
                    event = "session_connect_failed",
                    session_id = %self.session.id,
                    kind = err.kind(),
                    error = %err,
                    "Upstream connection failed"
                );
                self.terminate(close::connect_failure(&err), ctx);
                return;
            }
        };

        if let Err(err) = self.session.transition(SessionPhase::Relaying) {
            debug!(session_id = %self.session.id, "{}", err);
            return;
        }

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.upstream_tx = Some(tx);
        self.upstream_cancel = Some(cancel_tx);
        tokio::spawn(pump_upstream(
            sink,
            rx,
            cancel_rx,
            Arc::clone(&self.lease),
            ctx.address(),
        ));
        ctx.add_stream(stream);

        info!(session_id = %self.session.id, "Upstream connected, relaying");
    }

    /// Client → Upstream. Dropped unless the upstream is open and has queue room.
    fn forward_to_upstream(&mut self, message: UpstreamMessage) {
        let tx = match &self.upstream_tx {
            Some(tx) if self.session.is_relaying() => tx,
            _ => {
                self.session.counters.dropped += 1;
                debug!(session_id = %self.session.id, phase = self.session.phase().as_str(), "Upstream not open, frame dropped");
                return;
            }
        };

        match tx.try_send(message) {
            Ok(()) => self.session.counters.client_to_upstream += 1,
            Err(TrySendError::Full(_)) => {
                self.session.counters.dropped += 1;
                warn!(session_id = %self.session.id, capacity = self.queue_capacity, "Upstream queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.session.counters.dropped += 1;
                debug!(session_id = %self.session.id, "Upstream writer gone, frame dropped");
            }
        }
    }

    /// Close the client with `close` and release the upstream. First terminal event wins.
    fn terminate(&mut self, close: ClientClose, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.transition(SessionPhase::Closing).is_err() {
            return;
        }
        self.release_upstream();
        ctx.close(Some(close_reason(&close)));
        self.close = Some(close);
        ctx.stop();
    }

    /// Client closed or failed first: default-close the upstream and echo the close.
    fn on_client_gone(&mut self, reason: Option<ws::CloseReason>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.transition(SessionPhase::Closing).is_err() {
            ctx.stop();
            return;
        }
        self.release_upstream();
        self.close = Some(match &reason {
            Some(reason) => ClientClose::new(
                u16::from(reason.code),
                reason.description.clone().unwrap_or_default(),
            ),
            None => ClientClose::normal(),
        });
        ctx.close(reason);
        ctx.stop();
    }

    /// Stop feeding the writer and make it close the upstream without
    /// sending what is still queued.
    fn release_upstream(&mut self) {
        self.upstream_tx = None;
        if let Some(cancel) = self.upstream_cancel.take() {
            let _ = cancel.send(());
        }
    }
}

fn close_reason(close: &ClientClose) -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::from(close.code),
        description: (!close.reason.is_empty()).then(|| close.reason.clone()),
    }
}

/// Writes queued client frames to the upstream, then default-closes it.
///
/// ## Termination:
/// - The actor fires `cancel` (or drops it) when the session ends; pending
///   frames are abandoned, even in the middle of a blocked write.
/// - A failed write is reported back to the actor.
/// - The close handshake is bounded by `UPSTREAM_CLOSE_TIMEOUT`, so an upstream
///   that stopped reading cannot keep the session registered.
async fn pump_upstream(
    mut sink: SplitSink<UpstreamSocket, UpstreamMessage>,
    mut rx: mpsc::Receiver<UpstreamMessage>,
    mut cancel: oneshot::Receiver<()>,
    lease: Arc<SessionLease>,
    relay: Addr<RelaySocket>,
) {
    'relay: loop {
        let message = tokio::select! {
            biased;
            _ = &mut cancel => break 'relay,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break 'relay,
            },
        };

        tokio::select! {
            biased;
            _ = &mut cancel => break 'relay,
            sent = sink.send(message) => {
                if let Err(err) = sent {
                    relay.do_send(UpstreamWriteFailed(err.to_string()));
                    break 'relay;
                }
            }
        }
    }

    match tokio::time::timeout(UPSTREAM_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(session_id = %lease.id(), error = %err, "Upstream close did not complete cleanly");
        }
        Err(_) => {
            warn!(session_id = %lease.id(), "Upstream did not accept the close frame in time, dropping socket");
        }
    }
    debug!(session_id = %lease.id(), "Upstream writer finished");
}

/// Sent by the writer task when the upstream socket can no longer be written.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamWriteFailed(String);

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(event = "session_started", session_id = %self.session.id, "Relay session started");
        debug!(session_id = %self.session.id, params = self.session.params(), "Forwarded parameters");

        let prober = self.prober.clone();
        let probe = async move { prober.probe().await };
        ctx.spawn(
            probe
                .into_actor(self)
                .map(|report, act, ctx| act.on_probe_finished(report, ctx)),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.release_upstream();
        if !self.session.is_terminating() {
            let _ = self.session.transition(SessionPhase::Closing);
        }
        let _ = self.session.transition(SessionPhase::Closed);

        let counters = self.session.counters;
        self.state.record_session_end(&counters);

        let close = self.close.clone().unwrap_or_else(ClientClose::normal);
        info!(
            event = "session_closed",
            session_id = %self.session.id,
            code = close.code,
            reason = %close.reason,
            client_to_upstream = counters.client_to_upstream,
            upstream_to_client = counters.upstream_to_client,
            dropped = counters.dropped,
            started_at = %self.session.started_at.to_rfc3339(),
            duration_ms = self.session.elapsed().as_millis() as u64,
            "Relay session closed"
        );
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward_to_upstream(UpstreamMessage::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward_to_upstream(UpstreamMessage::Binary(data.to_vec()));
            }
            Ok(ws::Message::Continuation(item)) => match self.fragments.push(item) {
                Ok(Some(message)) => self.forward_to_upstream(message),
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id = %self.session.id, error = ?err, "Bad fragmented message from client");
                    self.terminate(err.into_close(), ctx);
                }
            },
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session.id, ?reason, "Client closed");
                self.on_client_gone(reason, ctx);
            }
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Client protocol error");
                self.on_client_gone(None, ctx);
            }
        }
    }

    /// Client TCP stream ended without a close frame.
    fn finished(&mut self, ctx: &mut Self::Context) {
        if !self.session.is_terminating() {
            debug!(session_id = %self.session.id, "Client disconnected");
        }
        self.on_client_gone(None, ctx);
    }
}

/// Frames from the upstream.
impl StreamHandler<Result<UpstreamMessage, UpstreamError>> for RelaySocket {
    fn handle(&mut self, msg: Result<UpstreamMessage, UpstreamError>, ctx: &mut Self::Context) {
        if !self.session.is_relaying() {
            return;
        }

        match msg {
            Ok(UpstreamMessage::Text(text)) => {
                self.session.counters.upstream_to_client += 1;
                ctx.text(text);
            }
            Ok(UpstreamMessage::Binary(data)) => {
                self.session.counters.upstream_to_client += 1;
                ctx.text(String::from_utf8_lossy(&data).into_owned());
            }
            Ok(UpstreamMessage::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                let reason = frame.as_ref().map(|f| &*f.reason);
                debug!(session_id = %self.session.id, ?code, ?reason, "Upstream closed");
                let close = close::translate_upstream_close(code, reason);
                self.terminate(close, ctx);
            }
            Ok(UpstreamMessage::Ping(_)) | Ok(UpstreamMessage::Pong(_)) | Ok(UpstreamMessage::Frame(_)) => {}
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Upstream transport error");
                self.terminate(close::upstream_transport_error(&err.to_string()), ctx);
            }
        }
    }

    /// Upstream stream ended without a close frame.
    fn finished(&mut self, ctx: &mut Self::Context) {
        self.terminate(ClientClose::normal(), ctx);
    }
}

impl Handler<UpstreamWriteFailed> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamWriteFailed, ctx: &mut Self::Context) {
        warn!(session_id = %self.session.id, error = %msg.0, "Upstream write failed");
        self.terminate(close::upstream_transport_error(&msg.0), ctx);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentError {
    /// Continuation without a start, or a new start inside a message
    Unexpected,
    TooLarge,
    InvalidUtf8,
}

impl FragmentError {
    fn into_close(self) -> ClientClose {
        match self {
            FragmentError::Unexpected => ClientClose::new(close::PROTOCOL_ERROR, "unexpected continuation frame"),
            FragmentError::TooLarge => ClientClose::new(close::MESSAGE_TOO_BIG, "fragmented message too large"),
            FragmentError::InvalidUtf8 => {
                ClientClose::new(close::UNSUPPORTED_DATA, "fragmented text message is not valid UTF-8")
            }
        }
    }
}

/// Reassembles a client message sent as continuation frames.
#[derive(Debug, Default)]
struct FragmentBuffer {
    kind: Option<FragmentKind>,
    data: Vec<u8>,
}

impl FragmentBuffer {
    fn push(&mut self, item: Item) -> Result<Option<UpstreamMessage>, FragmentError> {
        match item {
            Item::FirstText(bytes) => self.start(FragmentKind::Text, &bytes),
            Item::FirstBinary(bytes) => self.start(FragmentKind::Binary, &bytes),
            Item::Continue(bytes) => self.append(&bytes).map(|_| None),
            Item::Last(bytes) => {
                self.append(&bytes)?;
                self.finish().map(Some)
            }
        }
    }

    fn start(&mut self, kind: FragmentKind, bytes: &[u8]) -> Result<Option<UpstreamMessage>, FragmentError> {
        if self.kind.is_some() {
            self.reset();
            return Err(FragmentError::Unexpected);
        }
        self.kind = Some(kind);
        self.append(bytes).map(|_| None)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), FragmentError> {
        if self.kind.is_none() {
            return Err(FragmentError::Unexpected);
        }
        if self.data.len() + bytes.len() > MAX_FRAGMENTED_MESSAGE_BYTES {
            self.reset();
            return Err(FragmentError::TooLarge);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(&mut self) -> Result<UpstreamMessage, FragmentError> {
        let kind = self.kind.take().ok_or(FragmentError::Unexpected)?;
        let data = std::mem::take(&mut self.data);
        match kind {
            FragmentKind::Text => String::from_utf8(data)
                .map(UpstreamMessage::Text)
                .map_err(|_| FragmentError::InvalidUtf8),
            FragmentKind::Binary => Ok(UpstreamMessage::Binary(data)),
        }
    }

    fn reset(&mut self) {
        self.kind = None;
        self.data.clear();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Validates the handshake, registers the session (refused with 503 while
/// draining) and hands the connection to a `RelaySocket` actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    ws::handshake(&req).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let lease = state
        .sessions
        .register()
        .ok_or_else(|| AppError::Unavailable("relay is draining and not accepting new sessions".to_string()))?;

    let config = state.get_config();
    let session = RelaySession::new(lease.id(), req.query_string());
    let target = UpstreamTarget {
        url: upstream::build_upstream_url(&config.upstream.listen_url, session.params()),
        credential: config.upstream.api_key.clone(),
        auth_scheme: config.upstream.auth_scheme.clone(),
    };

    debug!(session_id = %session.id, peer = ?req.peer_addr(), "Accepted relay connection");

    let relay = RelaySocket::new(
        session,
        lease,
        target,
        config.relay.upstream_queue_capacity,
        state.get_ref().clone(),
    );

    ws::WsResponseBuilder::new(relay, &req, stream)
        .frame_size(MAX_FRAME_BYTES)
        .start()
        .map_err(|e| AppError::BadRequest(e.to_string()))
}
