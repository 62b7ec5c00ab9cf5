use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio_rustls::rustls::ClientConfig;
use url::Url;

use crate::util::buf_ext::MAX_REMAINING_LEN;

pub struct SessionConfig {
    /// `tcp://host:port`, `ssl://`, `tls://`, `tcps://` or `ws://host:port/path`
    pub uri: Url,

    /// Required for the TLS schemes and ignored otherwise. Building this configuration (trust
    ///  anchors, client certificates etc.) is the application's responsibility.
    pub tls_config: Option<Arc<ClientConfig>>,

    /// Upper bound for a single packet write to complete. The deadline covers the write
    ///  itself, not idle periods between writes. `None` or zero disables it.
    pub write_timeout: Option<Duration>,

    /// Upper bound for receiving CONNACK after CONNECT was written
    pub connect_timeout: Duration,

    /// Capacity of the application-priority outbound queue
    pub outbound_queue_size: usize,
    /// Capacity of the protocol-priority outbound queue (acks, PINGREQ, DISCONNECT)
    pub priority_queue_size: usize,
    /// Capacity of the queue between the inbound pump and the dispatcher. A full queue
    ///  stops reading from the network.
    pub inbound_queue_size: usize,

    /// How long the dispatcher waits to enqueue an acknowledgment on the priority queue. `None`
    ///  waits until the packet is enqueued or the session shuts down; with `Some`, the
    ///  acknowledgment is dropped (and logged) when the queue stays full for that long.
    pub ack_enqueue_timeout: Option<Duration>,

    /// Incoming packets with a larger body are treated as a read error
    pub max_packet_size: usize,
}

impl Debug for SessionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("uri", &self.uri.as_str())
            .field("tls_config", &self.tls_config.is_some())
            .field("write_timeout", &self.write_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("priority_queue_size", &self.priority_queue_size)
            .field("inbound_queue_size", &self.inbound_queue_size)
            .field("ack_enqueue_timeout", &self.ack_enqueue_timeout)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(uri: Url) -> SessionConfig {
        SessionConfig {
            uri,
            tls_config: None,
            write_timeout: None,
            connect_timeout: Duration::from_secs(30),
            outbound_queue_size: 100,
            priority_queue_size: 100,
            inbound_queue_size: 100,
            ack_enqueue_timeout: None,
            max_packet_size: MAX_REMAINING_LEN,
        }
    }

    pub fn parse(uri: &str) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig::new(Url::parse(uri)?))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_queue_size == 0 || self.priority_queue_size == 0 || self.inbound_queue_size == 0 {
            bail!("queue sizes must be greater than zero");
        }
        if self.max_packet_size > MAX_REMAINING_LEN {
            bail!("max packet size {} exceeds the protocol maximum of {}", self.max_packet_size, MAX_REMAINING_LEN);
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must not be zero");
        }
        if self.ack_enqueue_timeout.is_some_and(|t| t.is_zero()) {
            bail!("ack enqueue timeout must not be zero - use None to wait without a limit");
        }
        Ok(())
    }

    /// the write deadline to arm before each write, if any
    pub fn effective_write_timeout(&self) -> Option<Duration> {
        self.write_timeout
            .filter(|t| !t.is_zero())
    }
}
