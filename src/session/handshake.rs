use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::packet::{read_packet, ConnackPacket, ControlPacket, PacketKind};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeOutcome {
    Connack(ConnackPacket),
    /// The read failed; the error itself was put on the session's error queue
    NetworkError,
    /// The first packet was something other than CONNACK
    ProtocolViolation(PacketKind),
}

/// Reads the server's response to CONNECT directly from the connection, before any of the
///  session's tasks run. Whether the CONNACK's return code makes the session usable is for the
///  caller to decide.
pub async fn run_handshake<R: AsyncRead + Unpin>(reader: &mut R, max_packet_size: usize, errors: &mpsc::Sender<anyhow::Error>) -> HandshakeOutcome {
    match read_packet(reader, max_packet_size).await {
        Ok(ControlPacket::Connack(connack)) => {
            debug!("received CONNACK: {:?}", connack);
            HandshakeOutcome::Connack(connack)
        }
        Ok(other) => {
            warn!("expected CONNACK, received {:?}", other.kind());
            HandshakeOutcome::ProtocolViolation(other.kind())
        }
        Err(e) => {
            debug!("error reading CONNACK: {}", e);
            if errors.try_send(e).is_err() {
                warn!("error queue unavailable during handshake");
            }
            HandshakeOutcome::NetworkError
        }
    }
}
