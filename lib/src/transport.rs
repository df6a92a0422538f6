//! Message framing over byte streams and WebSockets
//!
//! The connection only sees whole message texts. Byte streams (stdio, in-process
//! pipes, sockets) are framed either with `Content-Length` headers or one JSON
//! document per line; a WebSocket carries one message per text frame.

use crate::config::Framing;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

const CONTENT_LENGTH: &str = "content-length";

/// Inbound half of a transport
#[async_trait]
pub trait MessageSource: Send {
    /// Next message text, or `None` once the peer closed the stream
    async fn read_message(&mut self) -> Result<Option<String>>;
}

/// Outbound half of a transport
#[async_trait]
pub trait MessageSink: Send {
    async fn write_message(&mut self, text: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct StreamSource<R> {
    reader: BufReader<R>,
    framing: Framing,
}

impl<R> StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing,
        }
    }

    async fn read_content_length(&mut self) -> Result<Option<String>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await?;
            if read == 0 {
                if saw_header {
                    return Err(AgentError::Protocol(
                        "Stream ended inside message headers".to_string(),
                    ));
                }
                return Ok(None);
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !saw_header {
                    continue;
                }
                break;
            }
            saw_header = true;

            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                    let length = value.trim().parse::<usize>().map_err(|e| {
                        AgentError::Protocol(format!("Invalid Content-Length '{}': {e}", value.trim()))
                    })?;
                    content_length = Some(length);
                }
            } else {
                return Err(AgentError::Protocol(format!("Malformed header line: {line}")));
            }
        }

        let length = content_length
            .ok_or_else(|| AgentError::Protocol("Missing Content-Length header".to_string()))?;
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        String::from_utf8(body)
            .map(Some)
            .map_err(|e| AgentError::Protocol(format!("Message body is not UTF-8: {e}")))
    }

    async fn read_line_delimited(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

#[async_trait]
impl<R> MessageSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Option<String>> {
        match self.framing {
            Framing::ContentLength => self.read_content_length().await,
            Framing::Newline => self.read_line_delimited().await,
        }
    }
}

pub struct StreamSink<W> {
    writer: W,
    framing: Framing,
}

impl<W> StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }
}

/// Frame a message body for a byte stream
pub fn frame(text: &str, framing: Framing) -> String {
    match framing {
        Framing::ContentLength => format!("Content-Length: {}\r\n\r\n{}", text.len(), text),
        Framing::Newline => format!("{text}\n"),
    }
}

#[async_trait]
impl<W> MessageSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(frame(text, self.framing).as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a reader/writer pair into boxed transport halves
pub fn stream_transport<R, W>(
    reader: R,
    writer: W,
    framing: Framing,
) -> (Box<dyn MessageSource>, Box<dyn MessageSink>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    (
        Box::new(StreamSource::new(reader, framing)),
        Box::new(StreamSink::new(writer, framing)),
    )
}

pub struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

/// Split an accepted WebSocket into boxed transport halves
pub fn websocket_transport<S>(socket: WebSocketStream<S>) -> (Box<dyn MessageSource>, Box<dyn MessageSink>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    (
        Box::new(WebSocketSource { stream }),
        Box::new(WebSocketSink { sink }),
    )
}

#[async_trait]
impl<S> MessageSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Option<String>> {
        while let Some(frame) = self.stream.next().await {
            let frame = frame.map_err(|e| AgentError::Protocol(format!("WebSocket error: {e}")))?;
            match frame {
                WsMessage::Text(text) => return Ok(Some(text.to_string())),
                WsMessage::Binary(bytes) => {
                    let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                        AgentError::Protocol(format!("Binary frame is not UTF-8: {e}"))
                    })?;
                    return Ok(Some(text));
                }
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<S> MessageSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .map_err(|e| AgentError::Protocol(format!("WebSocket send failed: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| AgentError::Protocol(format!("WebSocket close failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_content_length_framing() {
        let (client, server) = duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let body = r#"{"jsonrpc":"2.0","method":"initialized"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            body.len(),
            body
        );
        client_write.write_all(framed.as_bytes()).await.unwrap();
        client_write
            .write_all(frame("{}", Framing::ContentLength).as_bytes())
            .await
            .unwrap();
        drop(client_write);

        let mut source = StreamSource::new(server_read, Framing::ContentLength);
        assert_eq!(source.read_message().await.unwrap().as_deref(), Some(body));
        assert_eq!(source.read_message().await.unwrap().as_deref(), Some("{}"));
        assert_eq!(source.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes() {
        let (client, server) = duplex(1024);
        let (server_read, _w) = tokio::io::split(server);
        let (_r, client_write) = tokio::io::split(client);

        let mut sink = StreamSink::new(client_write, Framing::ContentLength);
        sink.write_message(r#"{"text":"héllo"}"#).await.unwrap();
        drop(sink);

        let mut source = StreamSource::new(server_read, Framing::ContentLength);
        assert_eq!(
            source.read_message().await.unwrap().as_deref(),
            Some(r#"{"text":"héllo"}"#)
        );
    }

    #[tokio::test]
    async fn test_newline_framing_skips_blank_lines() {
        let (client, server) = duplex(1024);
        let (server_read, _w) = tokio::io::split(server);
        let (_r, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"\n{\"a\":1}\n\n{\"b\":2}\n").await.unwrap();
        drop(client_write);

        let mut source = StreamSource::new(server_read, Framing::Newline);
        assert_eq!(source.read_message().await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(source.read_message().await.unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(source.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_content_length_is_protocol_error() {
        let (client, server) = duplex(1024);
        let (server_read, _w) = tokio::io::split(server);
        let (_r, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"X-Other: 1\r\n\r\n{}").await.unwrap();
        drop(client_write);

        let mut source = StreamSource::new(server_read, Framing::ContentLength);
        assert!(matches!(
            source.read_message().await,
            Err(AgentError::Protocol(_))
        ));
    }
}
