//! WebSocket server side: accept loop and per-connection frame I/O.
//!
//! Serves the same hand-rolled codec as the client. Server frames go out
//! unmasked; client frames arrive masked and are unmasked by the decoder.

use crate::error::{BotError, Result};
use crate::wire;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct WsServer {
    listener: TcpListener,
}

impl WsServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BotError::TransportDisconnect(format!("bind {addr}: {e}")))?;
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    /// Accept one client and complete the upgrade handshake.
    pub async fn accept(&self) -> Result<WsServerConn> {
        let (mut stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| BotError::TransportDisconnect(format!("accept: {e}")))?;
        tracing::debug!(%peer, "ws client connecting");

        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        let boundary = loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| BotError::TransportDisconnect(format!("handshake read: {e}")))?;
            if n == 0 {
                return Err(BotError::ProtocolViolation(
                    "client closed during handshake".into(),
                ));
            }
            head.extend_from_slice(&buf[..n]);
            if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            if head.len() > 64 * 1024 {
                return Err(BotError::ProtocolViolation("handshake request too large".into()));
            }
        };

        let head_text = String::from_utf8_lossy(&head[..boundary]).to_string();
        let leftover = head[boundary + 4..].to_vec();
        let (request_line, headers) = wire::parse_http_head(&head_text);
        if !request_line.starts_with("GET ") {
            return Err(BotError::ProtocolViolation(format!(
                "bad request line: {request_line}"
            )));
        }
        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| BotError::ProtocolViolation("missing Sec-WebSocket-Key".into()))?;

        let response = wire::server_response(&wire::accept_for_key(key));
        stream
            .write_all(response.as_bytes())
            .await
            .map_err(|e| BotError::TransportDisconnect(format!("handshake write: {e}")))?;

        Ok(WsServerConn {
            stream,
            pending: leftover,
        })
    }
}

pub struct WsServerConn {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl WsServerConn {
    /// Send one unmasked text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(text.as_bytes(), wire::OP_TEXT).await
    }

    pub async fn send_frame(&mut self, payload: &[u8], opcode: u8) -> Result<()> {
        let frame = wire::encode_frame(payload, opcode, false);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| BotError::TransportDisconnect(format!("write: {e}")))?;
        Ok(())
    }

    /// Receive the next frame. `Ok(None)` means the peer closed.
    pub async fn recv_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(frame) = wire::decode_frame(&self.pending)? {
                self.pending.drain(..frame.consumed);
                if frame.opcode == wire::OP_CLOSE {
                    return Ok(None);
                }
                if frame.opcode == wire::OP_PING {
                    self.send_frame(&frame.payload, wire::OP_PONG).await?;
                    continue;
                }
                return Ok(Some((frame.opcode, frame.payload)));
            }
            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|e| BotError::TransportDisconnect(format!("read: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Receive the next text/binary payload as a string.
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.recv_frame().await? {
                Some((opcode, payload))
                    if opcode == wire::OP_TEXT || opcode == wire::OP_BINARY =>
                {
                    return Ok(Some(String::from_utf8_lossy(&payload).to_string()));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Handshake against a raw TCP client so the server side is exercised
    // independently of the Transport.
    #[tokio::test]
    async fn handshake_produces_rfc_accept() {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_port().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request =
                wire::client_request("127.0.0.1", port, "/", "dGhlIHNhbXBsZSBub25jZQ==");
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let _conn = server.accept().await.unwrap();
        let response = client.await.unwrap();
        assert!(response.contains("101"));
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[tokio::test]
    async fn missing_key_is_protocol_violation() {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_port().unwrap();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            // Hold the socket open so the server reads the full head.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let result = server.accept().await;
        assert!(matches!(result, Err(BotError::ProtocolViolation(_))));
    }
}
