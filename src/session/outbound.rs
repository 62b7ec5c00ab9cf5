use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::packet::{write_packet, ControlPacket};
use crate::session::SessionShared;

/// Writes packets from the application queue and the protocol priority queue to the
///  connection, one at a time.
///
/// There is no fairness between the two queues, but each queue's order is preserved. A failed
///  write goes to the error queue and ends the pump. If the session is already stopping, the
///  pump closes the connection itself.
pub async fn run_outbound_pump<W: AsyncWrite + Unpin>(
    mut writer: W,
    shared: Arc<SessionShared>,
    mut obound: mpsc::Receiver<ControlPacket>,
    mut obound_priority: mpsc::Receiver<ControlPacket>,
) {
    debug!("starting outbound pump");
    let write_timeout = shared.config.effective_write_timeout();

    loop {
        let mut packet = select! {
            Some(packet) = obound_priority.recv() => packet,
            Some(packet) = obound.recv() => packet,
            _ = shared.guard.closed() => {
                debug!("connection closed - stopping outbound pump");
                return;
            }
        };

        if packet.needs_message_id() {
            let id = select! {
                id = shared.message_ids.allocate() => id,
                _ = shared.guard.closed() => {
                    debug!("connection closed while waiting for a message id - stopping outbound pump");
                    return;
                }
            };
            packet.set_message_id(id);
        }
        else if let Some(id) = packet.preassigned_message_id() {
            if !shared.message_ids.reserve(id) {
                debug!("preassigned message id {} is already in flight", id);
            }
        }

        trace!("writing {:?} (message id {:?})", packet.kind(), packet.message_id());
        let write_result = select! {
            r = write_with_deadline(&mut writer, &packet, write_timeout) => r,
            _ = shared.guard.closed() => {
                debug!("connection closed during write - stopping outbound pump");
                return;
            }
        };

        if let Err(e) = write_result {
            warn!("error writing to connection: {}", e);
            let escalated = shared.errors.send(e).await.is_ok();
            // a stopped dispatcher no longer tears down, so the connection is closed here
            if !escalated || shared.stop.is_cancelled() {
                debug!("session stopping - closing connection after failed write");
                shared.guard.close();
            }
            return;
        }
        shared.liveness.touch();

        if matches!(packet, ControlPacket::Disconnect) {
            debug!("DISCONNECT written - closing connection");
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down connection after DISCONNECT: {}", e);
            }
            shared.guard.close();
            return;
        }
    }
}

/// The deadline covers this write only, so idle time between writes never triggers it
async fn write_with_deadline<W: AsyncWrite + Unpin>(writer: &mut W, packet: &ControlPacket, write_timeout: Option<Duration>) -> anyhow::Result<()> {
    match write_timeout {
        None => write_packet(writer, packet).await,
        Some(write_timeout) => match timeout(write_timeout, write_packet(writer, packet)).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("write did not complete within {:?}", write_timeout)).into()),
        },
    }
}
