//! Gateway WebSocket client: connect/handshake, receive loop, heartbeat,
//! reconnect.
//!
//! The receive loop owns inbound ordering: frames are decoded and handed
//! to the message callback one at a time, awaited in place, so plugin
//! dispatch stays serialized exactly like the rest of the pipeline.
//! Outbound text goes through an unbounded channel drained by the same
//! connection task, which keeps send order stable across reconnects.

pub mod server;

use crate::config::WebSocketConfig;
use crate::error::{BotError, Result};
use crate::wire;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Inbound text handler; awaited on the receive loop.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Fired every time the connection transitions into Open.
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;

pub struct Transport {
    config: WebSocketConfig,
    state: Mutex<TransportState>,
    on_message: RwLock<Option<MessageHandler>>,
    on_open: RwLock<Option<OpenHandler>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    running: AtomicBool,
}

impl Transport {
    pub fn new(config: WebSocketConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            state: Mutex::new(TransportState::Idle),
            on_message: RwLock::new(None),
            on_open: RwLock::new(None),
            outbound_tx: tx,
            outbound_rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    pub fn set_on_message(&self, handler: MessageHandler) {
        *self.on_message.write() = Some(handler);
    }

    pub fn set_on_open(&self, handler: OpenHandler) {
        *self.on_open.write() = Some(handler);
    }

    /// Queue one text frame. Messages survive a reconnect; they are
    /// written in order once a connection is up.
    pub fn send_text(&self, text: String) {
        if self.outbound_tx.send(text).is_err() {
            tracing::warn!("transport outbound channel closed");
        }
    }

    /// A cheap sender handle for other subsystems (RpcGateway).
    pub fn sender(self: &Arc<Self>) -> Arc<dyn Fn(String) + Send + Sync> {
        let transport = self.clone();
        Arc::new(move |text| transport.send_text(text))
    }

    /// Spawn the connection maintenance task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let transport = self.clone();
        let rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("transport already started");
        tokio::spawn(async move { transport.run(rx).await })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.set_state(TransportState::Closing);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        let mut attempts: u32 = 0;
        while self.is_running() {
            self.set_state(TransportState::Connecting);
            match self.connect().await {
                Ok((stream, leftover)) => {
                    attempts = 0;
                    self.set_state(TransportState::Open);
                    tracing::info!(
                        host = %self.config.host,
                        port = self.config.port,
                        "gateway connected"
                    );
                    if let Some(cb) = self.on_open.read().clone() {
                        cb();
                    }
                    let reason = self.drive(stream, leftover, &mut outbound_rx).await;
                    self.set_state(TransportState::Closing);
                    match reason {
                        Ok(()) => tracing::info!("gateway connection closed"),
                        Err(e) => tracing::warn!(error = %e, "gateway connection lost"),
                    }
                    self.set_state(TransportState::Closed);
                }
                Err(e) => {
                    self.set_state(TransportState::Closed);
                    attempts += 1;
                    tracing::warn!(error = %e, attempt = attempts, "gateway connect failed");
                    let max = self.config.max_reconnect_attempts;
                    if max > 0 && attempts >= max {
                        tracing::error!("max reconnect attempts reached, giving up");
                        break;
                    }
                }
            }
            if !self.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_interval)).await;
        }
        self.set_state(TransportState::Closed);
    }

    /// TCP connect + upgrade handshake. Returns the stream and any bytes
    /// the server sent past the end of the HTTP head.
    async fn connect(&self) -> Result<(TcpStream, Vec<u8>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connect_timeout = Duration::from_secs(10);
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BotError::TransportDisconnect(format!("connect timeout to {addr}")))?
            .map_err(|e| BotError::TransportDisconnect(format!("connect {addr}: {e}")))?;

        let key = wire::generate_key();
        let request = wire::client_request(&self.config.host, self.config.port, &self.config.path, &key);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| BotError::TransportDisconnect(format!("handshake write: {e}")))?;

        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        let boundary = loop {
            let n = tokio::time::timeout(connect_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| BotError::TransportDisconnect("handshake read timeout".into()))?
                .map_err(|e| BotError::TransportDisconnect(format!("handshake read: {e}")))?;
            if n == 0 {
                return Err(BotError::ProtocolViolation(
                    "server closed during handshake".into(),
                ));
            }
            head.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_head_end(&head) {
                break pos;
            }
            if head.len() > 64 * 1024 {
                return Err(BotError::ProtocolViolation("handshake response too large".into()));
            }
        };

        let head_text = String::from_utf8_lossy(&head[..boundary]).to_string();
        let leftover = head[boundary + 4..].to_vec();
        let (status_line, headers) = wire::parse_http_head(&head_text);
        if !status_line.contains("101") {
            return Err(BotError::ProtocolViolation(format!(
                "unexpected handshake status: {status_line}"
            )));
        }
        let expected = wire::accept_for_key(&key);
        match headers.get("sec-websocket-accept") {
            Some(got) if *got == expected => {}
            other => {
                return Err(BotError::ProtocolViolation(format!(
                    "bad Sec-WebSocket-Accept: {other:?}"
                )))
            }
        }
        Ok((stream, leftover))
    }

    /// Run one established connection until it drops.
    async fn drive(
        &self,
        stream: TcpStream,
        leftover: Vec<u8>,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut pending: Vec<u8> = leftover;
        let mut buf = vec![0u8; 64 * 1024];
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval.max(1000));
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // the immediate first tick
        let mut last_recv = Instant::now();

        // Drain frames already buffered from the handshake read.
        self.process_pending(&mut pending, &mut writer).await?;

        loop {
            if !self.is_running() {
                let close = wire::encode_frame(b"", wire::OP_CLOSE, true);
                let _ = writer.write_all(&close).await;
                return Ok(());
            }
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read.map_err(|e| {
                        BotError::TransportDisconnect(format!("read: {e}"))
                    })?;
                    if n == 0 {
                        return Err(BotError::TransportDisconnect("read returned 0".into()));
                    }
                    last_recv = Instant::now();
                    pending.extend_from_slice(&buf[..n]);
                    self.process_pending(&mut pending, &mut writer).await?;
                }
                Some(text) = outbound_rx.recv() => {
                    let frame = wire::encode_frame(text.as_bytes(), wire::OP_TEXT, true);
                    writer.write_all(&frame).await.map_err(|e| {
                        BotError::TransportDisconnect(format!("write: {e}"))
                    })?;
                }
                _ = ticker.tick() => {
                    if last_recv.elapsed() > heartbeat * 2 {
                        return Err(BotError::TransportDisconnect(
                            "heartbeat timeout".into(),
                        ));
                    }
                    let ping = wire::encode_frame(b"", wire::OP_PING, true);
                    writer.write_all(&ping).await.map_err(|e| {
                        BotError::TransportDisconnect(format!("ping write: {e}"))
                    })?;
                }
            }
        }
    }

    async fn process_pending(
        &self,
        pending: &mut Vec<u8>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        loop {
            let frame = match wire::decode_frame(pending) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            };
            pending.drain(..frame.consumed);
            match frame.opcode {
                wire::OP_CLOSE => {
                    return Err(BotError::TransportDisconnect("close frame".into()));
                }
                wire::OP_PING => {
                    // Pong must carry the same payload, answered in-loop.
                    let pong = wire::encode_frame(&frame.payload, wire::OP_PONG, true);
                    writer
                        .write_all(&pong)
                        .await
                        .map_err(|e| BotError::TransportDisconnect(format!("pong write: {e}")))?;
                }
                wire::OP_PONG => {}
                wire::OP_TEXT | wire::OP_BINARY => {
                    let text = String::from_utf8_lossy(&frame.payload).to_string();
                    let handler = self.on_message.read().clone();
                    if let Some(handler) = handler {
                        handler(text).await;
                    }
                }
                _ => {}
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::server::WsServer;
    use super::*;

    fn test_config(port: u16) -> WebSocketConfig {
        WebSocketConfig {
            host: "127.0.0.1".into(),
            port,
            path: "/".into(),
            token: String::new(),
            heartbeat_interval: 60_000,
            reconnect_interval: 50,
            max_reconnect_attempts: 0,
        }
    }

    #[tokio::test]
    async fn connects_and_exchanges_text() {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_port().unwrap();

        let transport = Transport::new(test_config(port));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        transport.set_on_message(Arc::new(move |text| {
            let tx = seen_tx.clone();
            Box::pin(async move {
                let _ = tx.send(text);
            })
        }));
        let _task = transport.start();

        let mut conn = server.accept().await.unwrap();

        transport.send_text("{\"hello\":1}".to_string());
        let received = conn.recv_text().await.unwrap().unwrap();
        assert_eq!(received, "{\"hello\":1}");

        conn.send_text("{\"pong\":2}").await.unwrap();
        let inbound = seen_rx.recv().await.unwrap();
        assert_eq!(inbound, "{\"pong\":2}");
        assert_eq!(transport.state(), TransportState::Open);

        transport.shutdown();
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_port().unwrap();

        let transport = Transport::new(test_config(port));
        let _task = transport.start();

        let conn = server.accept().await.unwrap();
        drop(conn); // server closes the socket

        // Client should come back on its own.
        let mut conn = server.accept().await.unwrap();
        transport.send_text("after reconnect".to_string());
        let text = conn.recv_text().await.unwrap().unwrap();
        assert_eq!(text, "after reconnect");

        transport.shutdown();
    }

    #[tokio::test]
    async fn answers_server_ping_with_same_payload() {
        let server = WsServer::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_port().unwrap();

        let transport = Transport::new(test_config(port));
        let _task = transport.start();
        let mut conn = server.accept().await.unwrap();

        conn.send_frame(b"probe-123", wire::OP_PING).await.unwrap();
        let (opcode, payload) = conn.recv_frame().await.unwrap().unwrap();
        assert_eq!(opcode, wire::OP_PONG);
        assert_eq!(payload, b"probe-123");

        transport.shutdown();
    }
}
