//! Turns a connection URI into an open byte stream. All schemes end up as the same
//!  [Connection] type, so nothing downstream knows whether it talks plain TCP, TLS or
//!  WebSocket.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

mod connection_guard;
pub mod websocket;

pub use connection_guard::ConnectionGuard;

pub const DEFAULT_TCP_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl <T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// An open bidirectional byte stream to the server
pub type Connection = Box<dyn AsyncReadWrite>;

/// A single dial attempt - failures are returned to the caller, there are no retries here
pub async fn open_connection(uri: &Url, tls_config: Option<Arc<ClientConfig>>) -> anyhow::Result<Connection> {
    debug!("opening connection to {}", uri);

    let connection: Connection = match uri.scheme() {
        "tcp" => {
            let (host, port) = host_and_port(uri, DEFAULT_TCP_PORT)?;
            let stream = TcpStream::connect((host.as_str(), port)).await
                .with_context(|| format!("connecting to {}:{}", host, port))?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        "ssl" | "tls" | "tcps" => {
            let tls_config = tls_config
                .ok_or_else(|| anyhow!("scheme {} requires a TLS configuration", uri.scheme()))?;
            let (host, port) = host_and_port(uri, DEFAULT_TLS_PORT)?;
            let server_name = ServerName::try_from(host.clone())
                .with_context(|| format!("{} is not a valid TLS server name", host))?;

            let stream = TcpStream::connect((host.as_str(), port)).await
                .with_context(|| format!("connecting to {}:{}", host, port))?;
            stream.set_nodelay(true)?;
            let stream = TlsConnector::from(tls_config)
                .connect(server_name, stream).await
                .with_context(|| format!("TLS handshake with {}:{}", host, port))?;
            Box::new(stream)
        }
        "ws" => websocket::connect(uri).await?,
        other => bail!("unsupported connection scheme {:?}", other),
    };

    info!("connected to {}", uri);
    Ok(connection)
}

fn host_and_port(uri: &Url, default_port: u16) -> anyhow::Result<(String, u16)> {
    let host = uri.host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("connection URI {} has no host", uri))?;
    // IPv6 literals come back bracketed, which the resolver does not accept
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), uri.port().unwrap_or(default_port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

    #[rstest]
    #[case::explicit_port("tcp://broker.example:1234", DEFAULT_TCP_PORT, "broker.example", 1234)]
    #[case::default_port("tcp://broker.example", DEFAULT_TCP_PORT, "broker.example", 1883)]
    #[case::default_tls_port("ssl://broker.example", DEFAULT_TLS_PORT, "broker.example", 8883)]
    #[case::ipv6("tcp://[::1]:1883", DEFAULT_TCP_PORT, "::1", 1883)]
    fn test_host_and_port(#[case] uri: &str, #[case] default_port: u16, #[case] host: &str, #[case] port: u16) {
        let uri = Url::parse(uri).unwrap();
        assert_eq!(host_and_port(&uri, default_port).unwrap(), (host.to_string(), port));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let uri = Url::parse("http://localhost:1883").unwrap();
        assert!(open_connection(&uri, None).await.is_err());
    }

    #[rstest]
    #[case::ssl("ssl://localhost:8883")]
    #[case::tls("tls://localhost:8883")]
    #[case::tcps("tcps://localhost:8883")]
    #[tokio::test]
    async fn test_tls_requires_config(#[case] uri: &str) {
        let uri = Url::parse(uri).unwrap();
        let err = open_connection(&uri, None).await.err().unwrap();
        assert!(err.to_string().contains("requires a TLS configuration"));
    }

    #[tokio::test]
    async fn test_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let uri = Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        timeout(NETWORK_TIMEOUT, async {
            let mut connection = open_connection(&uri, None).await.unwrap();
            connection.write_all(b"abc").await.unwrap();
            connection.flush().await.unwrap();

            assert_eq!(&server.await.unwrap(), b"abc");
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        // bind and drop to get a port that is very likely unused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri = Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        assert!(timeout(NETWORK_TIMEOUT, open_connection(&uri, None)).await.unwrap().is_err());
    }
}
