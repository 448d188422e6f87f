//! The data channel: the authenticated duplex connection to one peer,
//! once matching has produced a socket (§4.6, §5). Outbound sends are
//! totally ordered per channel via a single writer task draining an
//! mpsc queue; inbound frames are decoded on a reader task and handed
//! to the dispatcher in arrival order. Grounded on the teacher's
//! transport-coordinator split between a connection and its read/write
//! pump tasks.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{decode_frame, encode_frame, PeerMessage};

/// Per §5: outbound sends suspend rather than spin when the channel is
/// saturated, but never block forever.
const SEND_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound frame queue + one inbound frame stream, bound to a peer.
pub struct PeerChannel {
    peer_id_hash: String,
    outbound: mpsc::Sender<PeerMessage>,
}

impl PeerChannel {
    /// Wrap an already-established TCP stream (post-matching) and spawn
    /// its reader/writer pump tasks. `inbound` receives every decoded
    /// frame in arrival order for the dispatcher to consume.
    pub fn spawn(peer_id_hash: String, stream: TcpStream, inbound: mpsc::Sender<(String, PeerMessage)>) -> Self {
        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<PeerMessage>(256);

        let writer_peer = peer_id_hash.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match encode_frame(&message) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if write_half.write_all(frame.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                    || write_half.flush().await.is_err()
                {
                    tracing::warn!(peer = %writer_peer, "outbound write failed, channel closing");
                    break;
                }
            }
        });

        let reader_peer = peer_id_hash.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_frame(&line) {
                            Ok(message) => {
                                if inbound.send((reader_peer.clone(), message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(peer = %reader_peer, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(peer = %reader_peer, error = %e, "read error, channel closing");
                        break;
                    }
                }
            }
        });

        Self {
            peer_id_hash,
            outbound: outbound_tx,
        }
    }

    pub fn peer_id_hash(&self) -> &str {
        &self.peer_id_hash
    }

    /// Enqueue a message for ordered delivery. Suspends under backpressure
    /// up to §5's 30 s send timeout rather than blocking forever.
    pub async fn send(&self, message: PeerMessage) -> Result<()> {
        tokio::time::timeout(SEND_BACKPRESSURE_TIMEOUT, self.outbound.send(message))
            .await
            .map_err(|_| Error::BackpressureTimeout)?
            .map_err(|_| Error::ChannelClosed)
    }
}
