//! MQTT over WebSocket: each write goes out as one binary frame, and incoming binary frames
//!  are concatenated into a plain byte stream so the codec does not see the framing.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::Context as _;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};
use url::Url;

use crate::transport::Connection;

pub const MQTT_SUBPROTOCOL: &str = "mqtt";

pub async fn connect(uri: &Url) -> anyhow::Result<Connection> {
    let mut request = uri.as_str().into_client_request()?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MQTT_SUBPROTOCOL));

    let (stream, response) = connect_async(request).await
        .with_context(|| format!("WebSocket handshake with {}", uri))?;
    debug!("WebSocket handshake complete: {}", response.status());

    Ok(Box::new(WsByteStream::new(stream)))
}

/// Presents a WebSocket message stream as an [AsyncRead] + [AsyncWrite] byte stream
pub struct WsByteStream<S> {
    inner: S,
    /// remainder of the last binary frame that did not fit into the caller's buffer
    pending: Bytes,
    eof: bool,
}

impl <S> WsByteStream<S> {
    pub fn new(inner: S) -> WsByteStream<S> {
        WsByteStream {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn to_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => io::Error::new(io::ErrorKind::BrokenPipe, e),
        e => io::Error::other(e),
    }
}

impl <S> AsyncRead for WsByteStream<S>
where S: Stream<Item = Result<Message, WsError>> + Unpin
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    trace!("received binary frame of {} bytes", data.len());
                    this.pending = Bytes::from(data);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("received WebSocket close: {:?}", frame);
                    this.eof = true;
                }
                None => {
                    this.eof = true;
                }
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected text frame on an MQTT WebSocket")));
                }
                Some(Ok(_)) => {} // ping / pong are answered by tungstenite
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            }
        }
    }
}

impl <S> AsyncWrite for WsByteStream<S>
where S: Sink<Message, Error = WsError> + Unpin
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.inner.poll_ready_unpin(cx)).map_err(to_io_error)?;
        this.inner.start_send_unpin(Message::binary(buf.to_vec())).map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.poll_flush_unpin(cx).map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().inner.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

    async fn ws_pair() -> (WsByteStream<WebSocketStream<DuplexStream>>, WebSocketStream<DuplexStream>) {
        let (client, server) = duplex(4096);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (WsByteStream::new(client), server)
    }

    #[tokio::test]
    async fn test_read_concatenates_binary_frames() {
        let (mut client, mut server) = ws_pair().await;

        server.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        server.send(Message::Ping(vec![9])).await.unwrap();
        server.send(Message::binary(vec![4u8, 5])).await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_read_splits_large_frame() {
        let (mut client, mut server) = ws_pair().await;
        server.send(Message::binary(vec![7u8; 10])).await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [7; 4]);
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [7; 6]);
    }

    #[tokio::test]
    async fn test_text_frame_is_invalid_data() {
        let (mut client, mut server) = ws_pair().await;
        server.send(Message::text("hello")).await.unwrap();

        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_close_frame_is_eof() {
        let (mut client, mut server) = ws_pair().await;
        server.send(Message::binary(vec![1u8])).await.unwrap();
        server.close(None).await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![1]);
    }

    #[tokio::test]
    async fn test_write_sends_binary_frame() {
        let (mut client, mut server) = ws_pair().await;
        client.write_all(&[0xc0, 0x00]).await.unwrap();
        client.flush().await.unwrap();

        let msg = server.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::binary(vec![0xc0u8, 0x00]));
    }

    #[tokio::test]
    async fn test_connect_requests_mqtt_subprotocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                assert_eq!(req.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), MQTT_SUBPROTOCOL);
                resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MQTT_SUBPROTOCOL));
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            ws.send(msg).await.unwrap();
        });

        let uri = Url::parse(&format!("ws://127.0.0.1:{}/mqtt", port)).unwrap();
        timeout(NETWORK_TIMEOUT, async {
            let mut connection = connect(&uri).await.unwrap();
            connection.write_all(b"ping").await.unwrap();
            // frames are only sent on flush
            connection.flush().await.unwrap();

            let mut buf = [0u8; 4];
            connection.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            server.await.unwrap();
        }).await.unwrap();
    }
}
