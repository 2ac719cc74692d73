//! Client network layer: TCP connect, the join sequence and the fixed-rate
//! replication tick.

use crate::server_session::ServerSession;
use crate::supervisor::{ClientConnection, ClientContext, Step};
use crate::world::ClientWorld;
use log::{debug, info, warn};
use shared::error::ProtocolError;
use shared::metrics::NetMetrics;
use shared::protocol::FRAME_HEADER_LEN;
use shared::serialization::TypeSchema;
use shared::transport::{read_message, write_message, Outbound};
use shared::NetMessage;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout_at, MissedTickBehavior};

/// Ticks between traffic summaries in the log.
const METRICS_LOG_INTERVAL: u64 = 1200;

/// Messages that control a running [`Client`].
#[derive(Debug)]
pub enum ClientMessage {
    Shutdown,
}

/// Local component and event types, bound to the server's ids on join.
#[derive(Debug, Clone, Default)]
pub struct ClientSchemas {
    pub components: Vec<TypeSchema>,
    pub events: Vec<TypeSchema>,
}

/// A client that has joined a server.
pub struct Client {
    session: ServerSession,
    net_tick: Duration,
    client_tx: mpsc::UnboundedSender<ClientMessage>,
    client_rx: mpsc::UnboundedReceiver<ClientMessage>,
}

fn send_all(outbound: &mpsc::UnboundedSender<Outbound>, messages: Vec<NetMessage>) {
    for message in messages {
        if outbound.send(Outbound::Message(message)).is_err() {
            break;
        }
    }
}

impl Client {
    /// Connects to `address` and runs the handshake and catalog sync. Progress
    /// and failures are also published on the context's join status.
    pub async fn connect(address: &str, ctx: ClientContext, schemas: ClientSchemas) -> Result<Self, ProtocolError> {
        let net_tick = ctx.config.net_tick();
        let join_status = Arc::clone(&ctx.join_status);
        join_status.set_current_activity(format!("Connecting to {}", address));

        let mut connection = ClientConnection::new(ctx, Instant::now());
        let deadline = connection
            .timeout_deadline()
            .unwrap_or_else(Instant::now);
        let stream = match timeout_at(deadline.into(), TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                join_status.set_error_message(format!("Failed to connect to {}: {}", address, e));
                return Err(e.into());
            }
            Err(_) => {
                join_status.set_error_message(ProtocolError::Timeout.to_string());
                return Err(ProtocolError::Timeout);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to disable Nagle: {}", e);
        }
        info!("Connected to {}", address);

        let (reader, writer) = stream.into_split();
        let metrics = Arc::new(NetMetrics::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&metrics)));
        tokio::spawn(read_loop(reader, inbound_tx, Arc::clone(&metrics)));

        connection.on_open(Instant::now());
        loop {
            let Some(deadline) = connection.timeout_deadline() else {
                break;
            };
            let message = match timeout_at(deadline.into(), inbound_rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    connection.on_close();
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "server closed the connection").into());
                }
                Err(_) => {
                    if let Some(Step::Close(err)) = connection.check_timeout(Instant::now()) {
                        let _ = outbound_tx.send(Outbound::Close);
                        return Err(err);
                    }
                    continue;
                }
            };

            match connection.on_message(message, Instant::now()) {
                Step::Reply(messages) => send_all(&outbound_tx, messages),
                Step::Close(err) => {
                    let _ = outbound_tx.send(Outbound::Close);
                    return Err(err);
                }
                Step::Joined { client_id, server_info } => {
                    info!("Joined server as entity {}", client_id);
                    let session = ServerSession::new(
                        client_id,
                        server_info,
                        &schemas.components,
                        &schemas.events,
                        outbound_tx,
                        inbound_rx,
                        metrics,
                    );
                    let (client_tx, client_rx) = mpsc::unbounded_channel();
                    return Ok(Client {
                        session,
                        net_tick,
                        client_tx,
                        client_rx,
                    });
                }
                Step::Forward(message) => warn!("Ignoring {} before join", message.payload.name()),
            }
        }

        Err(ProtocolError::UnexpectedMessage("JoinComplete"))
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession {
        &mut self.session
    }

    /// Sender that stops [`Client::run`] when given [`ClientMessage::Shutdown`].
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.client_tx.clone()
    }

    /// Replicates with the server until it disconnects or a shutdown is
    /// requested. Returns the server's disconnect reason, if it gave one.
    pub async fn run<W: ClientWorld>(&mut self, world: &mut W) -> Option<String> {
        let mut tick_interval = interval(self.net_tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.session.register_initial_blocks(world);
        let mut tick: u64 = 0;

        while self.session.is_connected() {
            tokio::select! {
                message = self.client_rx.recv() => match message {
                    Some(ClientMessage::Shutdown) | None => {
                        info!("Leaving server");
                        self.session.close();
                    }
                },

                _ = tick_interval.tick() => {
                    self.session.update(world);
                    tick += 1;

                    if tick % METRICS_LOG_INTERVAL == 0 {
                        let delta = self.session.metrics().take_delta();
                        debug!(
                            "Sent {} messages ({} bytes), received {} messages ({} bytes)",
                            delta.sent_messages, delta.sent_bytes, delta.received_messages, delta.received_bytes
                        );
                    }
                },
            }
        }

        let reason = self.session.disconnect_reason().map(str::to_string);
        match &reason {
            Some(reason) => info!("Disconnected from server: {}", reason),
            None => info!("Disconnected from server"),
        }
        reason
    }
}

/// Feeds decoded messages into a channel so the receiving side can wait on it
/// with timeouts and `select!` without losing partially read frames.
async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<NetMessage>, metrics: Arc<NetMetrics>) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                let size = bincode::serialized_size(&message).unwrap_or(0) as usize + FRAME_HEADER_LEN;
                metrics.record_received(size);
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection to server failed: {}", e);
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    metrics: Arc<NetMetrics>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message) => match write_message(&mut writer, &message).await {
                Ok(bytes) => metrics.record_sent(bytes),
                Err(e) => {
                    warn!("Failed to send {}: {}", message.payload.name(), e);
                    break;
                }
            },
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
