//! A single live MQTT session: one connection, driven by three cooperating tasks.
//!
//! * the inbound pump decodes packets from the connection and hands them to the dispatcher
//! * the outbound pump writes packets from two queues (application and protocol priority)
//! * the dispatcher drives the QoS acknowledgment flows, delivers PUBLISH packets to the
//!    application and is the only place where a failed session is torn down
//!
//! Fatal errors from any task end up on a shared error queue, and the dispatcher handles the
//!  first one by tearing the session down and notifying the [ConnectionLostHandler]. There
//!  is no reconnect at this level.

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::io::{split, BufReader};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, span, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::packet::{write_packet, ConnackPacket, ConnectPacket, ConnectReturnCode, ControlPacket, PublishPacket};
use crate::session::dispatcher::{run_dispatcher, Dispatcher};
use crate::session::handshake::{run_handshake, HandshakeOutcome};
use crate::session::inbound::run_inbound_pump;
use crate::session::liveness::Liveness;
use crate::session::message_ids::MessageIds;
use crate::session::outbound::run_outbound_pump;
use crate::transport::{open_connection, Connection, ConnectionGuard};

pub mod connection_lost;
pub mod dispatcher;
pub mod handshake;
pub mod inbound;
pub mod liveness;
pub mod message_ids;
pub mod outbound;

pub use connection_lost::ConnectionLostHandler;

/// Each pump reports at most one error before exiting, plus whatever external collaborators
///  report via [SessionHandle::report_error]
const ERROR_QUEUE_SIZE: usize = 8;

/// The server answered CONNECT with a non-zero return code
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectionRefused(pub ConnectReturnCode);

impl Display for ConnectionRefused {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection refused by server: {:?}", self.0)
    }
}
impl std::error::Error for ConnectionRefused {}

/// State shared by the session's tasks and all [SessionHandle]s
pub struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) connected: AtomicBool,
    pub(crate) liveness: Liveness,
    pub(crate) message_ids: MessageIds,
    pub(crate) guard: ConnectionGuard,
    /// set once and never reset
    pub(crate) stop: CancellationToken,
    pub(crate) obound: mpsc::Sender<ControlPacket>,
    pub(crate) obound_priority: mpsc::Sender<ControlPacket>,
    pub(crate) errors: mpsc::Sender<anyhow::Error>,
}

/// The receiving ends of the session's queues, consumed when the tasks are started
pub struct SessionQueues {
    pub obound: mpsc::Receiver<ControlPacket>,
    pub obound_priority: mpsc::Receiver<ControlPacket>,
    pub errors: mpsc::Receiver<anyhow::Error>,
}

impl SessionShared {
    pub fn new(config: Arc<SessionConfig>) -> (Arc<SessionShared>, SessionQueues) {
        let (obound_send, obound_recv) = mpsc::channel(config.outbound_queue_size);
        let (priority_send, priority_recv) = mpsc::channel(config.priority_queue_size);
        let (errors_send, errors_recv) = mpsc::channel(ERROR_QUEUE_SIZE);

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            config,
            connected: AtomicBool::new(false),
            liveness: Liveness::new(),
            message_ids: MessageIds::new(),
            guard: ConnectionGuard::new(),
            stop: CancellationToken::new(),
            obound: obound_send,
            obound_priority: priority_send,
            errors: errors_send,
        });
        let queues = SessionQueues {
            obound: obound_recv,
            obound_priority: priority_recv,
            errors: errors_recv,
        };
        (shared, queues)
    }

    /// Ends the session without notifying the connection-lost handler, for failures the
    ///  caller of [start] is told about directly
    fn shut_down_quietly(&self) {
        self.connected.store(false, Ordering::Release);
        self.stop.cancel();
        self.guard.close();
    }
}

/// A cheap, cloneable reference to a session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl Debug for SessionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("uri", &self.shared.config.uri.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> SessionHandle {
        SessionHandle { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// For the keepalive timer: last successful write and whether a PINGREQ is unanswered
    pub fn liveness(&self) -> &Liveness {
        &self.shared.liveness
    }

    pub fn message_ids(&self) -> &MessageIds {
        &self.shared.message_ids
    }

    /// Enqueues an application packet. QoS 1/2 PUBLISH, SUBSCRIBE and UNSUBSCRIBE get their
    ///  message id assigned by the outbound pump if it is 0. A nonzero id is reserved when the
    ///  packet is written, so it is not handed out again until it is acknowledged.
    pub async fn send(&self, packet: ControlPacket) -> anyhow::Result<()> {
        self.enqueue(&self.shared.obound, packet).await
    }

    /// Enqueues a protocol packet (acknowledgments, PINGREQ) on the priority queue
    pub async fn send_priority(&self, packet: ControlPacket) -> anyhow::Result<()> {
        self.enqueue(&self.shared.obound_priority, packet).await
    }

    async fn enqueue(&self, queue: &mpsc::Sender<ControlPacket>, packet: ControlPacket) -> anyhow::Result<()> {
        if self.shared.stop.is_cancelled() {
            bail!("session {} is shut down", self.shared.id);
        }
        select! {
            r = queue.send(packet) => r.map_err(|_| anyhow!("session {} is shut down", self.shared.id)),
            _ = self.shared.stop.cancelled() => Err(anyhow!("session {} is shut down", self.shared.id)),
        }
    }

    /// Marks a ping as outstanding and enqueues PINGREQ. The dispatcher clears the flag when
    ///  PINGRESP arrives.
    pub async fn send_ping(&self) -> anyhow::Result<()> {
        self.shared.liveness.set_ping_outstanding(true);
        self.send_priority(ControlPacket::Pingreq).await
    }

    /// Reports a fatal error from outside the session's own tasks (e.g. a keepalive timeout),
    ///  triggering the same teardown as a transport error
    pub async fn report_error(&self, error: anyhow::Error) {
        if self.shared.errors.send(error).await.is_err() {
            debug!("session {} already terminated - ignoring reported error", self.shared.id);
        }
    }

    /// Orderly shutdown: stops the session's tasks and sends DISCONNECT. The outbound pump
    ///  closes the connection after writing it. No connection-lost notification is sent.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            bail!("session {} is not connected", self.shared.id);
        }
        info!("disconnecting session {}", self.shared.id);
        self.shared.stop.cancel();

        select! {
            r = self.shared.obound_priority.send(ControlPacket::Disconnect) => {
                if r.is_err() {
                    self.shared.guard.close();
                }
            }
            _ = self.shared.guard.closed() => {}
        }
        Ok(())
    }

    /// completes when the connection is closed, for whatever reason
    pub async fn closed(&self) {
        self.shared.guard.closed().await
    }

    /// A token that is cancelled when the session stops, for components tied to the session's
    ///  lifetime
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop.child_token()
    }
}

/// Opens the transport for `config.uri` and starts a session on it.
///
/// PUBLISH packets received from the server are handed to `deliveries`. If the session later
///  fails, `connection_lost` is called once with the originating error.
pub async fn connect(
    config: SessionConfig,
    connect: ConnectPacket,
    deliveries: mpsc::Sender<PublishPacket>,
    connection_lost: Arc<dyn ConnectionLostHandler>,
) -> anyhow::Result<SessionHandle> {
    config.validate()?;
    let connection = open_connection(&config.uri, config.tls_config.clone()).await?;
    start(config, connection, connect, deliveries, connection_lost).await
}

/// Starts a session on an already open connection: writes CONNECT and waits for an accepting
///  CONNACK.
///
/// When resuming a session (`clean_session == false`), CONNACK is read directly from the
///  connection before any task is started, so that nothing the server sends after it is
///  processed before the caller gets the handle. Otherwise the tasks are started right away and
///  the dispatcher passes CONNACK on.
pub async fn start(
    config: SessionConfig,
    connection: Connection,
    connect: ConnectPacket,
    deliveries: mpsc::Sender<PublishPacket>,
    connection_lost: Arc<dyn ConnectionLostHandler>,
) -> anyhow::Result<SessionHandle> {
    config.validate()?;
    let (shared, queues) = SessionShared::new(Arc::new(config));

    let session_id = shared.id;
    let span = span!(Level::INFO, "mqtt_session", ?session_id);
    do_start(shared, queues, connection, connect, deliveries, connection_lost)
        .instrument(span)
        .await
}

async fn do_start(
    shared: Arc<SessionShared>,
    mut queues: SessionQueues,
    connection: Connection,
    connect: ConnectPacket,
    deliveries: mpsc::Sender<PublishPacket>,
    connection_lost: Arc<dyn ConnectionLostHandler>,
) -> anyhow::Result<SessionHandle> {
    let connect_timeout = shared.config.connect_timeout;
    let resume = !connect.clean_session;

    let (reader, mut writer) = split(connection);
    let mut reader = BufReader::new(reader);

    debug!("sending CONNECT for client id {:?}", connect.client_id);
    write_packet(&mut writer, &ControlPacket::Connect(connect)).await
        .context("writing CONNECT")?;
    shared.liveness.touch();

    if resume {
        let outcome = timeout(connect_timeout, run_handshake(&mut reader, shared.config.max_packet_size, &shared.errors)).await
            .map_err(|_| anyhow!("no CONNACK received within {:?}", connect_timeout))?;

        let connack = match outcome {
            HandshakeOutcome::Connack(connack) => connack,
            HandshakeOutcome::NetworkError => {
                let error = queues.errors.try_recv()
                    .unwrap_or_else(|_| anyhow!("network error"));
                return Err(error.context("reading CONNACK"));
            }
            HandshakeOutcome::ProtocolViolation(kind) => bail!("expected CONNACK, received {:?}", kind),
        };
        check_accepted(&connack)?;

        shared.connected.store(true, Ordering::Release);
        spawn_tasks(shared.clone(), queues, reader, writer, deliveries, connection_lost, None);
        info!("session resumed (session present: {})", connack.session_present);
        return Ok(SessionHandle::new(shared));
    }

    let (connack_send, connack_recv) = oneshot::channel();
    shared.connected.store(true, Ordering::Release);
    spawn_tasks(shared.clone(), queues, reader, writer, deliveries, connection_lost, Some(connack_send));

    let connack = match timeout(connect_timeout, connack_recv).await {
        Ok(Ok(Ok(connack))) => connack,
        Ok(Ok(Err(e))) => {
            // the dispatcher already tore the session down
            return Err(e.context("waiting for CONNACK"));
        }
        Ok(Err(_)) => {
            shared.shut_down_quietly();
            bail!("session stopped before CONNACK was received");
        }
        Err(_) => {
            shared.shut_down_quietly();
            bail!("no CONNACK received within {:?}", connect_timeout);
        }
    };

    if let Err(e) = check_accepted(&connack) {
        shared.shut_down_quietly();
        return Err(e);
    }
    info!("session established");
    Ok(SessionHandle::new(shared))
}

fn check_accepted(connack: &ConnackPacket) -> anyhow::Result<()> {
    if connack.return_code != ConnectReturnCode::Accepted {
        warn!("server refused connection: {:?}", connack.return_code);
        return Err(ConnectionRefused(connack.return_code).into());
    }
    Ok(())
}

fn spawn_tasks<R, W>(
    shared: Arc<SessionShared>,
    queues: SessionQueues,
    reader: R,
    writer: W,
    deliveries: mpsc::Sender<PublishPacket>,
    connection_lost: Arc<dyn ConnectionLostHandler>,
    connack: Option<oneshot::Sender<anyhow::Result<ConnackPacket>>>,
)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_send, inbound_recv) = mpsc::channel(shared.config.inbound_queue_size);

    let dispatcher = Dispatcher::new(shared.clone(), inbound_recv, queues.errors, deliveries, connection_lost, connack);

    tokio::spawn(run_inbound_pump(reader, shared.clone(), inbound_send).instrument(Span::current()));
    tokio::spawn(run_outbound_pump(writer, shared, queues.obound, queues.obound_priority).instrument(Span::current()));
    tokio::spawn(run_dispatcher(dispatcher).instrument(Span::current()));
}
