//! The session's protocol state machine.
//!
//! QoS 2 runs in both directions through here, told apart by which packet arrives first for an
//!  identifier: PUBLISH starts a receiver flow (PUBREC, then PUBCOMP for the peer's PUBREL),
//!  PUBREC continues a sender flow (PUBREL, then release on PUBCOMP).

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument, Span};

use crate::packet::{ConnackPacket, ControlPacket, PacketKind, PublishPacket, QoS, SubackPacket};
use crate::session::{ConnectionLostHandler, SessionHandle, SessionShared};

/// The error queue plus an error that was taken off it while the dispatcher was busy with a
///  hand-off and still has to be acted on
struct ErrorInbox {
    errors: mpsc::Receiver<anyhow::Error>,
    pending: Option<anyhow::Error>,
}

pub struct Dispatcher {
    shared: Arc<SessionShared>,
    inbound: mpsc::Receiver<ControlPacket>,
    error_inbox: ErrorInbox,
    deliveries: mpsc::Sender<PublishPacket>,
    connection_lost: Arc<dyn ConnectionLostHandler>,
    /// receives the first CONNACK, or the error if the session fails before that
    connack: Option<oneshot::Sender<anyhow::Result<ConnackPacket>>>,
    ack_enqueue_timeout: Option<Duration>,
    /// identifiers of received QoS 2 messages that were delivered and PUBREC'ed, but not yet
    ///  completed by PUBREL
    qos2_received: BitSet,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<SessionShared>,
        inbound: mpsc::Receiver<ControlPacket>,
        errors: mpsc::Receiver<anyhow::Error>,
        deliveries: mpsc::Sender<PublishPacket>,
        connection_lost: Arc<dyn ConnectionLostHandler>,
        connack: Option<oneshot::Sender<anyhow::Result<ConnackPacket>>>,
    ) -> Dispatcher {
        let ack_enqueue_timeout = shared.config.ack_enqueue_timeout;
        Dispatcher {
            shared,
            inbound,
            error_inbox: ErrorInbox {
                errors,
                pending: None,
            },
            deliveries,
            connection_lost,
            connack,
            ack_enqueue_timeout,
            qos2_received: BitSet::new(),
        }
    }
}

pub async fn run_dispatcher(mut dispatcher: Dispatcher) {
    debug!("starting dispatcher");
    let mut inbound_closed = false;

    loop {
        if let Some(error) = dispatcher.error_inbox.pending.take() {
            dispatcher.tear_down(error);
            return;
        }

        select! {
            biased;
            _ = dispatcher.shared.stop.cancelled() => {
                debug!("session stopped - dispatcher exiting");
                return;
            }
            Some(error) = dispatcher.error_inbox.errors.recv() => {
                dispatcher.tear_down(error);
                return;
            }
            packet = dispatcher.inbound.recv(), if !inbound_closed => {
                match packet {
                    Some(packet) => dispatcher.on_packet(packet).await,
                    // the inbound pump reports its error before it exits
                    None => inbound_closed = true,
                }
            }
        }
    }
}

/// Waits for a potentially blocking hand-off while still watching the error queue and the stop
///  signal. Returns `None` if the hand-off was abandoned; an error seen in the meantime is
///  parked in the inbox for the dispatcher loop.
async fn hand_off<T>(send: impl Future<Output = T>, error_inbox: &mut ErrorInbox, stop: &CancellationToken) -> Option<T> {
    select! {
        biased;
        result = send => Some(result),
        Some(error) = error_inbox.errors.recv() => {
            debug!("error while handing off - deferring it to the dispatcher loop");
            error_inbox.pending = Some(error);
            None
        }
        _ = stop.cancelled() => None,
    }
}

impl Dispatcher {
    async fn on_packet(&mut self, packet: ControlPacket) {
        trace!("dispatching {:?}", packet.kind());

        match packet {
            ControlPacket::Pingresp => {
                self.shared.liveness.set_ping_outstanding(false);
            }
            ControlPacket::Suback(SubackPacket { message_id, .. })
            | ControlPacket::Unsuback { message_id }
            | ControlPacket::Puback { message_id }
            | ControlPacket::Pubcomp { message_id } => {
                self.shared.message_ids.release(message_id);
            }
            ControlPacket::Pubrec { message_id } => {
                self.send_ack(ControlPacket::ack(PacketKind::Pubrel, message_id)).await;
            }
            ControlPacket::Pubrel { message_id } => {
                self.send_ack(ControlPacket::ack(PacketKind::Pubcomp, message_id)).await;
                self.qos2_received.remove(message_id as usize);
            }
            ControlPacket::Publish(publish) => {
                self.on_publish(publish).await;
            }
            ControlPacket::Connack(connack) => {
                match self.connack.take() {
                    Some(connack_sender) => {
                        let _ = connack_sender.send(Ok(connack));
                    }
                    None => warn!("unexpected CONNACK on an established session - ignoring"),
                }
            }
            ControlPacket::Connect(_)
            | ControlPacket::Subscribe(_)
            | ControlPacket::Unsubscribe(_)
            | ControlPacket::Pingreq
            | ControlPacket::Disconnect => {
                warn!("received {:?}, which a server must not send - ignoring", packet.kind());
            }
        }
    }

    async fn on_publish(&mut self, publish: PublishPacket) {
        let message_id = publish.message_id;

        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish).await;
            }
            QoS::AtLeastOnce => {
                if self.deliver(publish).await {
                    self.send_ack(ControlPacket::ack(PacketKind::Puback, message_id)).await;
                }
            }
            QoS::ExactlyOnce => {
                if self.qos2_received.contains(message_id as usize) {
                    debug!("QoS 2 message {} redelivered before PUBREL - acknowledging without delivering again", message_id);
                }
                else {
                    if !self.deliver(publish).await {
                        return;
                    }
                    self.qos2_received.insert(message_id as usize);
                }
                self.send_ack(ControlPacket::ack(PacketKind::Pubrec, message_id)).await;
            }
        }
    }

    /// Returns `false` if delivery was interrupted by an error or by shutdown
    async fn deliver(&mut self, publish: PublishPacket) -> bool {
        trace!("delivering message {} on topic {:?}", publish.message_id, publish.topic);
        match hand_off(self.deliveries.send(publish), &mut self.error_inbox, &self.shared.stop).await {
            Some(Ok(())) => true,
            Some(Err(_)) => {
                warn!("application delivery channel is closed - dropping message");
                true
            }
            None => false,
        }
    }

    /// Enqueues an acknowledgment on the priority queue, subject to the configured enqueue
    ///  timeout
    async fn send_ack(&mut self, ack: ControlPacket) {
        let kind = ack.kind();
        let message_id = ack.message_id();
        let priority = &self.shared.obound_priority;

        let enqueued = match self.ack_enqueue_timeout {
            None => hand_off(priority.send(ack), &mut self.error_inbox, &self.shared.stop).await
                .map(|r| r.is_ok()),
            Some(ack_timeout) => hand_off(timeout(ack_timeout, priority.send(ack)), &mut self.error_inbox, &self.shared.stop).await
                .map(|r| match r {
                    Ok(r) => r.is_ok(),
                    Err(_) => {
                        warn!("priority queue full for {:?} - dropping {:?} for message id {:?}", ack_timeout, kind, message_id);
                        false
                    }
                }),
        };

        if enqueued == Some(true) {
            trace!("enqueued {:?} for message id {:?}", kind, message_id);
        }
    }

    /// Runs once per session, for the first error: nothing is processed afterwards
    fn tear_down(&mut self, error: anyhow::Error) {
        error!("tearing down session: {:#}", error);

        self.shared.connected.store(false, Ordering::Release);
        self.shared.stop.cancel();
        self.shared.guard.close();

        if let Some(connack_sender) = self.connack.take() {
            // still starting up - the error goes to the caller waiting for CONNACK
            let _ = connack_sender.send(Err(error));
            return;
        }

        let connection_lost = self.connection_lost.clone();
        let session = SessionHandle::new(self.shared.clone());
        tokio::spawn(async move {
            connection_lost.on_connection_lost(session, error).await;
        }.instrument(Span::current()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::config::SessionConfig;
    use crate::packet::ConnectReturnCode;
    use crate::session::connection_lost::MockConnectionLostHandler;
    use crate::session::SessionQueues;

    struct Fixture {
        shared: Arc<SessionShared>,
        priority: mpsc::Receiver<ControlPacket>,
        inbound: mpsc::Sender<ControlPacket>,
        deliveries: mpsc::Receiver<PublishPacket>,
        lost: mpsc::UnboundedReceiver<String>,
        dispatcher: tokio::task::JoinHandle<()>,
    }

    fn start(configure: impl FnOnce(&mut SessionConfig), delivery_queue_size: usize) -> Fixture {
        start_with_connack(configure, delivery_queue_size, None)
    }

    fn start_with_connack(configure: impl FnOnce(&mut SessionConfig), delivery_queue_size: usize, connack: Option<oneshot::Sender<anyhow::Result<ConnackPacket>>>) -> Fixture {
        let mut config = SessionConfig::parse("tcp://localhost:1883").unwrap();
        configure(&mut config);
        let (shared, SessionQueues { obound_priority, errors, .. }) = SessionShared::new(Arc::new(config));
        shared.connected.store(true, Ordering::Release);

        let (inbound_send, inbound_recv) = mpsc::channel(10);
        let (deliveries_send, deliveries_recv) = mpsc::channel(delivery_queue_size);
        let (lost_send, lost_recv) = mpsc::unbounded_channel();

        let mut handler = MockConnectionLostHandler::new();
        handler.expect_on_connection_lost()
            .returning(move |_, error| {
                lost_send.send(error.to_string()).unwrap();
            });

        let dispatcher = Dispatcher::new(shared.clone(), inbound_recv, errors, deliveries_send, Arc::new(handler), connack);
        Fixture {
            shared,
            priority: obound_priority,
            inbound: inbound_send,
            deliveries: deliveries_recv,
            lost: lost_recv,
            dispatcher: tokio::spawn(run_dispatcher(dispatcher)),
        }
    }

    fn publish(qos: QoS, message_id: u16, payload: &'static [u8]) -> ControlPacket {
        ControlPacket::Publish(PublishPacket {
            qos,
            topic: "a/b".to_string(),
            message_id,
            payload: Bytes::from_static(payload),
            ..Default::default()
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_qos1_publish() {
        let mut f = start(|_| {}, 10);

        f.inbound.send(publish(QoS::AtLeastOnce, 7, b"hello")).await.unwrap();

        let delivered = f.deliveries.recv().await.unwrap();
        assert_eq!(delivered.payload, Bytes::from_static(b"hello"));
        assert_eq!(delivered.qos, QoS::AtLeastOnce);
        assert_eq!(delivered.message_id, 7);
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Puback, 7));
    }

    #[tokio::test]
    async fn test_qos0_publish_is_not_acknowledged() {
        let mut f = start(|_| {}, 10);

        f.inbound.send(publish(QoS::AtMostOnce, 0, b"x")).await.unwrap();
        f.inbound.send(ControlPacket::Pingresp).await.unwrap();

        assert_eq!(f.deliveries.recv().await.unwrap().payload, Bytes::from_static(b"x"));
        // the PINGRESP was processed after the publish, and nothing was enqueued for either
        wait_until(|| !f.shared.liveness.ping_outstanding()).await;
        assert!(f.priority.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_qos2_receiver_flow() {
        let mut f = start(|_| {}, 10);

        f.inbound.send(publish(QoS::ExactlyOnce, 3, b"exactly once")).await.unwrap();
        assert_eq!(f.deliveries.recv().await.unwrap().message_id, 3);
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubrec, 3));

        // a redelivery before PUBREL is acknowledged again, but not delivered again
        f.inbound.send(publish(QoS::ExactlyOnce, 3, b"exactly once")).await.unwrap();
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubrec, 3));
        assert!(f.deliveries.try_recv().is_err());

        f.inbound.send(ControlPacket::ack(PacketKind::Pubrel, 3)).await.unwrap();
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubcomp, 3));

        // the flow is complete, so the same id starts a new one
        f.inbound.send(publish(QoS::ExactlyOnce, 3, b"again")).await.unwrap();
        assert_eq!(f.deliveries.recv().await.unwrap().payload, Bytes::from_static(b"again"));
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubrec, 3));
    }

    #[tokio::test]
    async fn test_qos2_sender_flow() {
        let mut f = start(|_| {}, 10);
        let id = f.shared.message_ids.try_allocate().unwrap();

        f.inbound.send(ControlPacket::ack(PacketKind::Pubrec, id)).await.unwrap();
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubrel, id));
        assert!(f.shared.message_ids.is_in_flight(id));

        f.inbound.send(ControlPacket::ack(PacketKind::Pubcomp, id)).await.unwrap();
        wait_until(|| !f.shared.message_ids.is_in_flight(id)).await;
        assert!(f.priority.try_recv().is_err());
    }

    #[rstest]
    #[case::puback(ControlPacket::ack(PacketKind::Puback, 1))]
    #[case::pubcomp(ControlPacket::ack(PacketKind::Pubcomp, 1))]
    #[case::unsuback(ControlPacket::ack(PacketKind::Unsuback, 1))]
    #[case::suback(ControlPacket::Suback(SubackPacket { message_id: 1, return_codes: vec![0] }))]
    #[tokio::test]
    async fn test_terminating_acks_release_id(#[case] ack: ControlPacket) {
        let f = start(|_| {}, 10);
        assert_eq!(f.shared.message_ids.try_allocate(), Some(1));

        f.inbound.send(ack).await.unwrap();
        wait_until(|| !f.shared.message_ids.is_in_flight(1)).await;
    }

    #[tokio::test]
    async fn test_pingresp_clears_ping_outstanding() {
        let f = start(|_| {}, 10);
        f.shared.liveness.set_ping_outstanding(true);

        f.inbound.send(ControlPacket::Pingresp).await.unwrap();
        wait_until(|| !f.shared.liveness.ping_outstanding()).await;
    }

    #[tokio::test]
    async fn test_unexpected_packets_are_ignored() {
        let mut f = start(|_| {}, 10);

        f.inbound.send(ControlPacket::Pingreq).await.unwrap();
        f.inbound.send(ControlPacket::Connack(ConnackPacket::default())).await.unwrap();
        f.inbound.send(publish(QoS::AtLeastOnce, 5, b"still running")).await.unwrap();

        assert_eq!(f.deliveries.recv().await.unwrap().message_id, 5);
        assert!(f.shared.connected.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_connack_is_forwarded() {
        let (connack_send, connack_recv) = oneshot::channel();
        let f = start_with_connack(|_| {}, 10, Some(connack_send));

        let connack = ConnackPacket { session_present: true, return_code: ConnectReturnCode::Accepted };
        f.inbound.send(ControlPacket::Connack(connack.clone())).await.unwrap();
        assert_eq!(connack_recv.await.unwrap().unwrap(), connack);
    }

    #[tokio::test]
    async fn test_error_before_connack_goes_to_starter() {
        let (connack_send, connack_recv) = oneshot::channel();
        let mut f = start_with_connack(|_| {}, 10, Some(connack_send));

        f.shared.errors.send(anyhow!("boom")).await.unwrap();
        assert_eq!(connack_recv.await.unwrap().unwrap_err().to_string(), "boom");

        f.dispatcher.await.unwrap();
        assert!(f.lost.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_teardown_exactly_once() {
        let mut f = start(|_| {}, 10);

        f.shared.errors.send(anyhow!("write failed")).await.unwrap();
        f.shared.errors.send(anyhow!("read failed")).await.unwrap();
        f.dispatcher.await.unwrap();

        assert!(!f.shared.connected.load(Ordering::Acquire));
        assert!(f.shared.stop.is_cancelled());
        assert!(f.shared.guard.is_closed());

        assert_eq!(f.lost.recv().await.unwrap(), "write failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.lost.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_errors_tear_down_once() {
        let mut f = start(|_| {}, 10);

        let mut reporters = Vec::new();
        for i in 0..4 {
            let errors = f.shared.errors.clone();
            reporters.push(tokio::spawn(async move {
                let _ = errors.send(anyhow!("error {}", i)).await;
            }));
        }
        for r in reporters {
            r.await.unwrap();
        }
        f.dispatcher.await.unwrap();

        assert!(f.lost.recv().await.unwrap().starts_with("error "));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.lost.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_exits_without_callback() {
        let mut f = start(|_| {}, 10);

        f.shared.stop.cancel();
        f.dispatcher.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.lost.try_recv().is_err());
        assert!(!f.shared.guard.is_closed());
    }

    #[tokio::test]
    async fn test_error_during_blocked_delivery_is_not_lost() {
        let mut f = start(|_| {}, 1);

        // fill the delivery queue, so the second publish blocks the dispatcher
        f.inbound.send(publish(QoS::AtMostOnce, 0, b"1")).await.unwrap();
        f.inbound.send(publish(QoS::AtMostOnce, 0, b"2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.shared.errors.send(anyhow!("connection reset")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), &mut f.dispatcher).await.unwrap().unwrap();

        assert_eq!(f.lost.recv().await.unwrap(), "connection reset");
        assert_eq!(f.deliveries.recv().await.unwrap().payload, Bytes::from_static(b"1"));
        assert!(f.deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_during_blocked_ack_is_not_lost() {
        let mut f = start(|_| {}, 10);
        while f.shared.obound_priority.try_send(ControlPacket::Pingreq).is_ok() {}

        f.inbound.send(ControlPacket::ack(PacketKind::Pubrec, 9)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.shared.errors.send(anyhow!("connection reset")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), &mut f.dispatcher).await.unwrap().unwrap();
        assert_eq!(f.lost.recv().await.unwrap(), "connection reset");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_enqueue_timeout_drops_ack() {
        let mut f = start(|c| c.ack_enqueue_timeout = Some(Duration::from_secs(1)), 10);
        let mut num_queued = 0;
        while f.shared.obound_priority.try_send(ControlPacket::Pingreq).is_ok() {
            num_queued += 1;
        }

        f.inbound.send(ControlPacket::ack(PacketKind::Pubrel, 4)).await.unwrap();
        f.inbound.send(ControlPacket::Pingresp).await.unwrap();
        f.shared.liveness.set_ping_outstanding(true);

        // the PUBCOMP was dropped after the timeout, and the dispatcher moved on
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.shared.liveness.ping_outstanding());
        for _ in 0..num_queued {
            assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::Pingreq);
        }
        assert!(f.priority.try_recv().is_err());
        assert!(f.shared.connected.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_enqueue_waits_without_timeout() {
        let mut f = start(|_| {}, 10);
        while f.shared.obound_priority.try_send(ControlPacket::Pingreq).is_ok() {}

        f.inbound.send(ControlPacket::ack(PacketKind::Pubrec, 4)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // make room: the PUBREL follows the queued packets
        while let Ok(packet) = f.priority.try_recv() {
            if packet != ControlPacket::Pingreq {
                panic!("unexpected {:?}", packet);
            }
        }
        assert_eq!(f.priority.recv().await.unwrap(), ControlPacket::ack(PacketKind::Pubrel, 4));
    }
}
