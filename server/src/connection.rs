//! TCP transport for the replication server.
//!
//! One task per connection. The task owns the socket and a bounded outbound
//! queue; everything it learns flows to the simulation loop as [`NetEvent`]s
//! over a channel, so the loop never touches a socket directly. Framing and
//! compression live in `shared::wire`; this module only moves bytes.

use log::{debug, info, warn};
use shared::error::DisconnectReason;
use shared::messages::Envelope;
use shared::wire::{encode_frame, FrameDecoder};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Identifies one accepted connection for its lifetime. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What the transport reports to the simulation loop.
#[derive(Debug)]
pub enum NetEvent {
    /// A socket was accepted. `outbound` is the handle for sending frames
    /// to this connection; dropping it closes the connection.
    Connected {
        conn: ConnId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Envelope>,
    },
    /// A complete envelope arrived.
    Message { conn: ConnId, envelope: Envelope },
    /// The connection task ended, for whatever reason.
    Disconnected { conn: ConnId, reason: DisconnectReason },
}

/// Accepts connections forever, spawning one task per socket. Returns when
/// the event channel is closed, which means the simulation loop is gone.
pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::Sender<NetEvent>,
    queue_capacity: usize,
) {
    let mut next_conn: u64 = 0;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        next_conn += 1;
        let conn = ConnId(next_conn);
        info!("{} accepted from {}", conn, addr);

        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        if events
            .send(NetEvent::Connected {
                conn,
                addr,
                outbound: outbound_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        tokio::spawn(run_connection(conn, stream, outbound_rx, events.clone()));
    }
}

/// Drives one connection until either side gives up. Reads are done with
/// plain `read` into a scratch buffer so the select below stays
/// cancellation safe; the frame decoder reassembles whatever arrives.
async fn run_connection(
    conn: ConnId,
    mut stream: TcpStream,
    mut outbound: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<NetEvent>,
) {
    let (mut reader, mut writer) = stream.split();
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    let reason;

    'conn: loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("{} closed by peer", conn);
                    reason = DisconnectReason::Quit;
                    break 'conn;
                }
                Ok(n) => {
                    decoder.feed(&chunk[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(envelope)) => {
                                if events
                                    .send(NetEvent::Message { conn, envelope })
                                    .await
                                    .is_err()
                                {
                                    // Simulation loop is gone; just close.
                                    reason = DisconnectReason::Shutdown;
                                    break 'conn;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("{} sent an undecodable frame: {}", conn, e);
                                reason = DisconnectReason::ProtocolError;
                                break 'conn;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("{} read error: {}", conn, e);
                    reason = DisconnectReason::Quit;
                    break 'conn;
                }
            },
            queued = outbound.recv() => match queued {
                Some(envelope) => {
                    let frame = match encode_frame(&envelope) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("{} dropping connection, cannot encode {}: {}",
                                conn, envelope.kind(), e);
                            reason = DisconnectReason::ProtocolError;
                            break 'conn;
                        }
                    };
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!("{} write error: {}", conn, e);
                        reason = DisconnectReason::Quit;
                        break 'conn;
                    }
                }
                // The server dropped its sender: deliberate disconnect,
                // everything queued before the drop has been written.
                None => {
                    reason = DisconnectReason::Shutdown;
                    break 'conn;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    let _ = events.send(NetEvent::Disconnected { conn, reason }).await;
    info!("{} finished: {}", conn, reason);
}
