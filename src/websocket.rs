//! # WebSocket Chat Endpoint
//!
//! `GET /ws/chat` upgrades to a WebSocket and starts one chat
//! [`Session`] for the connection.
//!
//! ## Bridging actors and tasks:
//! actix delivers socket messages to the [`ChatWebSocket`] actor, but the
//! session pipeline runs as ordinary tokio tasks. The bridge works both ways:
//! - **inbound**: the actor pushes text and binary messages into a bounded
//!   channel read by [`Session::run`]
//! - **outbound**: the session's writer sends [`SendText`] messages to the
//!   actor's address, and the actor writes them to the socket. `Addr::send`
//!   waits for the mailbox, so a slow client slows the writer down
//!
//! ## Connection Lifecycle:
//! 1. The upgrade claims a slot of `performance.max_concurrent_sessions`
//!    (HTTP 503 when none is left)
//! 2. `started` spawns the session, which greets the client with `welcome`
//! 3. Protocol pings every 30 seconds; no pong for 60 seconds closes the socket
//! 4. `stopped` cancels the session scope. Every in-flight vendor call ends
//!    and the slot is released when the actor is dropped

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::AppError;
use crate::protocol::codec::{HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::protocol::OutboundFrame;
use crate::session::{FrameSink, InboundMessage, Session, SessionDeps, TransportError};
use crate::state::{AppState, SessionPermit};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest WebSocket message accepted: one maximal wire frame.
pub const MAX_MESSAGE_SIZE: usize = MAX_PAYLOAD_LEN + HEADER_LEN + 8;

/// A serialized outbound frame for the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendText(pub String);

/// Ask the actor to close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection;

pub struct ChatWebSocket {
    session_id: String,
    inbound: mpsc::Sender<InboundMessage>,
    /// Session inputs, consumed when the actor starts.
    pending: Option<(SessionDeps, mpsc::Receiver<InboundMessage>)>,
    cancel: CancelToken,
    last_heartbeat: Instant,
    _permit: SessionPermit,
}

impl ChatWebSocket {
    pub fn new(session_id: String, deps: SessionDeps, permit: SessionPermit) -> Self {
        let (inbound, rx) = mpsc::channel(deps.settings.inbound_queue_capacity);
        Self {
            session_id,
            inbound,
            pending: Some((deps, rx)),
            cancel: CancelToken::new(),
            last_heartbeat: Instant::now(),
            _permit: permit,
        }
    }

    fn forward(&mut self, message: InboundMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match self.inbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, "Inbound queue full, dropping client message");
                if let Ok(json) = OutboundFrame::error(503, "Server busy, message dropped").to_json() {
                    ctx.text(json);
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Session ended, closing socket");
                ctx.stop();
            }
        }
    }
}

/// Session output written through the actor's mailbox.
struct ActorSink {
    addr: Addr<ChatWebSocket>,
}

#[async_trait]
impl FrameSink for ActorSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.addr
            .send(SendText(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.addr.do_send(CloseConnection);
    }
}

impl Actor for ChatWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        if let Some((deps, rx)) = self.pending.take() {
            let sink = Box::new(ActorSink { addr: ctx.address() });
            let session = Session::new(&self.session_id, deps, sink, self.cancel.clone());
            tokio::spawn(session.run(rx));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.cancel.cancel();
        info!(session_id = %self.session_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChatWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(InboundMessage::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(InboundMessage::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for ChatWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseConnection> for ChatWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket upgrade handler for `/ws/chat`.
pub async fn chat_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(permit) = app_state.try_acquire_session() else {
        warn!(
            peer = ?req.connection_info().peer_addr(),
            "Session limit reached, rejecting WebSocket upgrade"
        );
        return Err(AppError::ServiceUnavailable("Too many concurrent sessions".to_string()).into());
    };

    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket chat connection"
    );

    let websocket = ChatWebSocket::new(session_id, app_state.session_deps(), permit);
    ws::WsResponseBuilder::new(websocket, &req, stream)
        .frame_size(MAX_MESSAGE_SIZE)
        .start()
}
