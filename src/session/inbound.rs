use std::sync::Arc;

use anyhow::anyhow;
use tokio::io::AsyncRead;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::packet::{read_packet, ControlPacket};
use crate::session::SessionShared;

/// Decodes packets from the connection in wire order and hands them to the dispatcher.
///
/// A full inbound queue stops reading, which pushes back on the server through TCP flow
///  control. A read error is escalated to the error queue unless the session was already
///  stopped, in which case it is the expected result of closing the connection.
pub async fn run_inbound_pump<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<SessionShared>, inbound: mpsc::Sender<ControlPacket>) {
    debug!("starting inbound pump");

    let error = loop {
        let read_result = select! {
            r = read_packet(&mut reader, shared.config.max_packet_size) => r,
            _ = shared.guard.closed() => Err(anyhow!("connection closed")),
        };

        match read_result {
            Ok(packet) => {
                trace!("received {:?}", packet.kind());
                if inbound.send(packet).await.is_err() {
                    debug!("dispatcher terminated - stopping inbound pump");
                    return;
                }
            }
            Err(e) => break e,
        }
    };

    if shared.stop.is_cancelled() {
        debug!("inbound pump stopped: {}", error);
        return;
    }

    warn!("error reading from connection: {}", error);
    if shared.errors.send(error).await.is_err() {
        debug!("dispatcher terminated - dropping read error");
    }
}
