use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::Parser;
use mqtt_engine::packet::{ConnectPacket, ControlPacket, QoS, SubscribePacket};
use mqtt_engine::session::connection_lost::LoggingConnectionLostHandler;
use mqtt_engine::{connect, SessionConfig, SessionHandle};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

/// Subscribes to topic filters and prints everything that is published on them
#[derive(Parser)]
struct Args {
    /// e.g. tcp://localhost:1883 or ws://localhost:8080/mqtt
    uri: String,

    #[clap(long, required = true)]
    topic: Vec<String>,

    #[clap(long, default_value = "mqtt-engine-subscribe")]
    client_id: String,

    #[clap(long, default_value_t = 1)]
    qos: u8,

    /// keepalive interval in seconds, 0 disables keepalive
    #[clap(long, default_value_t = 30)]
    keep_alive: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let qos = QoS::try_from(args.qos)
        .map_err(|_| anyhow!("invalid QoS {}", args.qos))?;

    let config = SessionConfig::parse(&args.uri)?;
    let connect_packet = ConnectPacket {
        client_id: args.client_id,
        keep_alive: args.keep_alive,
        ..Default::default()
    };

    let (deliveries_send, mut deliveries) = mpsc::channel(100);
    let session = connect(config, connect_packet, deliveries_send, Arc::new(LoggingConnectionLostHandler)).await?;
    info!("connected, session id {}", session.id());

    session.send(ControlPacket::Subscribe(SubscribePacket {
        message_id: 0,
        topics: args.topic.iter().map(|t| (t.clone(), qos)).collect(),
    })).await?;

    if args.keep_alive > 0 {
        tokio::spawn(run_keepalive(session.clone(), Duration::from_secs(args.keep_alive as u64)));
    }

    loop {
        select! {
            msg = deliveries.recv() => {
                match msg {
                    Some(msg) => println!("{} [{:?}]: {}", msg.topic, msg.qos, String::from_utf8_lossy(&msg.payload)),
                    None => break,
                }
            }
            _ = session.closed() => {
                bail!("connection closed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                session.disconnect().await?;
                session.closed().await;
                break;
            }
        }
    }
    Ok(())
}

/// Sends PINGREQ when nothing was written for a keepalive interval, and gives up on the session
///  if a ping stays unanswered for another interval
async fn run_keepalive(session: SessionHandle, interval: Duration) {
    let stop = session.stop_token();
    let mut ticks = tokio::time::interval(interval / 4);

    loop {
        select! {
            _ = ticks.tick() => {}
            _ = stop.cancelled() => return,
        }

        let liveness = session.liveness();
        if liveness.since_last_contact() < interval {
            continue;
        }
        if liveness.ping_outstanding() {
            warn!("no PINGRESP within {:?}", interval);
            session.report_error(anyhow!("keepalive timeout")).await;
            return;
        }
        if let Err(e) = session.send_ping().await {
            warn!("could not send PINGREQ: {}", e);
            return;
        }
    }
}
