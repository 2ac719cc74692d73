//! Server network layer: TCP accept loop, per-connection tasks and the
//! fixed-rate replication tick.

use crate::context::ServerContext;
use crate::directory::{PendingClient, ReplicationDirectory};
use crate::session::ClientId;
use crate::supervisor::{ServerConnection, Step};
use crate::world::{EntityStore, PlayerStore};
use log::{debug, error, info, warn};
use shared::metrics::NetMetrics;
use shared::protocol::FRAME_HEADER_LEN;
use shared::transport::{read_message, write_message, Outbound};
use shared::NetMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Ticks between traffic summaries in the log.
const METRICS_LOG_INTERVAL: u64 = 1200;

/// Messages sent from connection tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    ClientJoined(PendingClient),
    ClientDisconnected { id: ClientId },
    Shutdown,
}

/// Main server coordinating connections and replication
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    directory: ReplicationDirectory,
    store: Box<dyn EntityStore>,
    players: Box<dyn PlayerStore>,
    next_client_id: Arc<AtomicU64>,
    started: Instant,
    tick: u64,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        ctx: Arc<ServerContext>,
        store: Box<dyn EntityStore>,
        players: Box<dyn PlayerStore>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Server {
            listener,
            directory: ReplicationDirectory::new(Arc::clone(&ctx)),
            ctx,
            store,
            players,
            next_client_id: Arc::new(AtomicU64::new(1)),
            started: Instant::now(),
            tick: 0,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sender that stops [`Server::run`] when given [`ServerMessage::Shutdown`].
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn directory_mut(&mut self) -> &mut ReplicationDirectory {
        &mut self.directory
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(&self.ctx);
        let server_tx = self.server_tx.clone();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to disable Nagle for {}: {}", addr, e);
        }

        tokio::spawn(async move {
            info!("Connection {} from {}", id, addr);
            let (reader, writer) = stream.into_split();
            handle_connection(id, reader, writer, ctx, server_tx).await;
            info!("Connection {} from {} closed", id, addr);
        });
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.ctx.config.net_tick());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!("Error accepting connection: {}", e),
                },

                message = self.server_rx.recv() => match message {
                    Some(ServerMessage::ClientJoined(pending)) => self.directory.queue_client(pending),
                    Some(ServerMessage::ClientDisconnected { id }) => self.directory.queue_disconnect(id),
                    Some(ServerMessage::Shutdown) | None => {
                        info!("Server shutting down");
                        break;
                    }
                },

                _ = tick_interval.tick() => {
                    self.ctx.set_game_time(self.started.elapsed().as_millis() as u64);
                    self.directory.update(self.store.as_mut(), self.players.as_mut());
                    self.tick += 1;

                    if self.tick % METRICS_LOG_INTERVAL == 0 {
                        self.log_metrics();
                    }
                },
            }
        }

        self.directory.shutdown();
        Ok(())
    }

    fn log_metrics(&self) {
        for session in self.directory.sessions() {
            if let Some(remote) = session.as_remote() {
                let delta = remote.metrics().take_delta();
                debug!(
                    "{}: sent {} messages ({} bytes), received {} messages ({} bytes)",
                    remote.core().name,
                    delta.sent_messages,
                    delta.sent_bytes,
                    delta.received_messages,
                    delta.received_bytes
                );
            }
        }
    }
}

fn send_all(outbound: &mpsc::UnboundedSender<Outbound>, messages: Vec<NetMessage>) {
    for message in messages {
        if outbound.send(Outbound::Message(message)).is_err() {
            break;
        }
    }
}

/// Drives one connection through handshake and catalog sync, then forwards
/// replication traffic to its session until the peer goes away.
async fn handle_connection(
    id: ClientId,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    ctx: Arc<ServerContext>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let metrics = Arc::new(NetMetrics::new());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&metrics)));

    let mut connection = ServerConnection::new(ctx, Instant::now());
    send_all(&outbound_tx, connection.on_open(Instant::now()));
    let mut inbound: Option<mpsc::UnboundedSender<NetMessage>> = None;

    loop {
        let result = match connection.timeout_deadline() {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), read_message(&mut reader)).await {
                    Ok(result) => result,
                    Err(_) => {
                        if let Some(Step::Close(messages)) = connection.check_timeout(Instant::now()) {
                            send_all(&outbound_tx, messages);
                            let _ = outbound_tx.send(Outbound::Close);
                            break;
                        }
                        continue;
                    }
                }
            }
            None => read_message(&mut reader).await,
        };

        let message = match result {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!("Connection {}: {}", id, e);
                break;
            }
        };
        let size = bincode::serialized_size(&message).unwrap_or(0) as usize + FRAME_HEADER_LEN;
        metrics.record_received(size);

        match connection.on_message(message, Instant::now()) {
            Step::Reply(messages) => send_all(&outbound_tx, messages),
            Step::Close(messages) => {
                send_all(&outbound_tx, messages);
                let _ = outbound_tx.send(Outbound::Close);
                break;
            }
            Step::Join { peer, request, slot } => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                inbound = Some(inbound_tx);
                let pending = PendingClient {
                    id,
                    peer_id: peer.id,
                    request,
                    outbound: outbound_tx.clone(),
                    inbound: inbound_rx,
                    metrics: Arc::clone(&metrics),
                    slot: Some(slot),
                };
                if server_tx.send(ServerMessage::ClientJoined(pending)).is_err() {
                    break;
                }
            }
            Step::Forward(message) => {
                if let Some(inbound) = &inbound {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
            }
        }
    }

    if connection.on_close() {
        let _ = server_tx.send(ServerMessage::ClientDisconnected { id });
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
