use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::time::timeout;

use crate::packet::{read_packet, write_packet, ControlPacket};
use crate::transport::Connection;
use crate::util::buf_ext::MAX_REMAINING_LEN;

const BUFFER_SIZE: usize = 64 * 1024;
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The server end of an in-memory connection, scripted by a test
pub struct TestBroker {
    stream: DuplexStream,
}

impl TestBroker {
    /// Returns the client end, to be passed to [crate::session::start], and the broker
    pub fn new() -> (Connection, TestBroker) {
        let (client, server) = duplex(BUFFER_SIZE);
        (Box::new(client), TestBroker { stream: server })
    }

    /// Waits for the next packet the client writes
    pub async fn expect_packet(&mut self) -> anyhow::Result<ControlPacket> {
        timeout(EXPECT_TIMEOUT, read_packet(&mut self.stream, MAX_REMAINING_LEN)).await
            .context("timeout waiting for a packet from the client")?
    }

    pub async fn send(&mut self, packet: &ControlPacket) -> anyhow::Result<()> {
        write_packet(&mut self.stream, packet).await
    }

    /// Waits for the client to close the connection, failing on any further data
    pub async fn expect_eof(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; 1];
        let n = timeout(EXPECT_TIMEOUT, self.stream.read(&mut buf)).await
            .context("timeout waiting for the client to close the connection")??;
        if n != 0 {
            bail!("expected the connection to be closed, but received data");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut client, mut broker) = TestBroker::new();

        write_packet(&mut client, &ControlPacket::Pingreq).await.unwrap();
        assert_eq!(broker.expect_packet().await.unwrap(), ControlPacket::Pingreq);

        broker.send(&ControlPacket::Pingresp).await.unwrap();
        assert_eq!(read_packet(&mut client, MAX_REMAINING_LEN).await.unwrap(), ControlPacket::Pingresp);

        client.shutdown().await.unwrap();
        broker.expect_eof().await.unwrap();
    }
}
