//! Upstream client: the connect/send/receive state machine for a single
//! configured Passport host.
//!
//! One [`UpstreamClient`] exists per `CLIENT-N` section of a `.proxy`
//! file, shared by every POS connection that dispatches to it. A
//! `tokio::sync::Mutex` around the connection gives each client a single
//! flight: only one request is ever in the air at a time, matching the
//! reference host's behavior of serializing Passport exchanges per link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::framing;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(150);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a single upstream (one `CLIENT-N` section).
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub card_prefix_masks: Vec<String>,
    pub connect_timeout: Duration,
    pub retry_timeout: Duration,
    pub response_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(host: String, port: u16, card_prefix_masks: Vec<String>) -> Self {
        Self {
            host,
            port,
            card_prefix_masks,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connected,
    Cooldown,
}

struct Inner {
    state: ConnState,
    stream: Option<BufReader<TcpStream>>,
    last_failed_connect_at: Option<Instant>,
}

/// A Passport host reachable over TCP, with reconnect cooldown and a
/// single-flight request lock.
pub struct UpstreamClient {
    pub config: UpstreamConfig,
    inner: Mutex<Inner>,
    requests_sent: AtomicU64,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ConnState::Idle,
                stream: None,
                last_failed_connect_at: None,
            }),
            requests_sent: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Does `card_id` match one of this upstream's configured prefix
    /// masks? An empty mask list matches nothing.
    pub fn matches_card(&self, card_id: &str) -> bool {
        self.config
            .card_prefix_masks
            .iter()
            .any(|mask| card_id.starts_with(mask.as_str()))
    }

    /// Write `frame` and return without reading a response. Used for
    /// `MulticastNoResponse` dispatch, where the spec is explicit that
    /// no read is ever attempted against these upstreams — any bytes
    /// they later send back are left undrained on the socket.
    pub async fn send(&self, frame: &[u8]) -> Result<(), ProxyError> {
        let mut guard = self.inner.lock().await;
        self.ensure_connected(&mut guard).await?;
        let result = self.send_locked(&mut guard, frame).await;
        if result.is_err() {
            self.disconnect_locked(&mut guard);
        }
        result
    }

    async fn send_locked(&self, guard: &mut Inner, frame: &[u8]) -> Result<(), ProxyError> {
        let stream = guard
            .stream
            .as_mut()
            .expect("ensure_connected leaves a connected stream");
        stream.get_mut().write_all(frame).await?;
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send `frame` and wait for exactly one response frame, honoring
    /// the configured response timeout.
    pub async fn send_and_wait_response(&self, frame: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.send_and_wait_response_with_timeout(frame, self.config.response_timeout)
            .await
    }

    /// Same as [`Self::send_and_wait_response`] but with an explicit
    /// timeout override, used by dispatch's overall deadline.
    pub async fn send_and_wait_response_with_timeout(
        &self,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ProxyError> {
        let mut guard = self.inner.lock().await;
        self.ensure_connected(&mut guard).await?;

        let result = self.send_and_wait_locked(&mut guard, frame, timeout).await;
        if result.is_err() {
            self.disconnect_locked(&mut guard);
        }
        result
    }

    async fn send_and_wait_locked(
        &self,
        guard: &mut Inner,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ProxyError> {
        let stream = guard
            .stream
            .as_mut()
            .expect("ensure_connected leaves a connected stream");
        stream.get_mut().write_all(frame).await?;
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let response = tokio::time::timeout(timeout, framing::read_frame(stream))
            .await
            .map_err(|_| ProxyError::ResponseTimeout {
                host: self.config.host.clone(),
                port: self.config.port,
                timeout_secs: timeout.as_secs(),
            })??;
        Ok(response)
    }

    async fn ensure_connected(&self, guard: &mut Inner) -> Result<(), ProxyError> {
        if guard.state == ConnState::Connected && guard.stream.is_some() {
            return Ok(());
        }

        if guard.state == ConnState::Cooldown {
            if let Some(last_failed) = guard.last_failed_connect_at {
                let elapsed = last_failed.elapsed();
                if elapsed < self.config.retry_timeout {
                    return Err(ProxyError::RetryCooldown {
                        host: self.config.host.clone(),
                        port: self.config.port,
                        remaining_secs: (self.config.retry_timeout - elapsed).as_secs(),
                    });
                }
            }
        }

        self.connect_locked(guard).await
    }

    async fn connect_locked(&self, guard: &mut Inner) -> Result<(), ProxyError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!(addr, "connecting to upstream");
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await;

        match connect {
            Ok(Ok(stream)) => {
                info!(addr, "connected to upstream");
                guard.stream = Some(BufReader::new(stream));
                guard.state = ConnState::Connected;
                guard.last_failed_connect_at = None;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(addr, error = %e, "failed to connect to upstream");
                guard.state = ConnState::Cooldown;
                guard.last_failed_connect_at = Some(Instant::now());
                Err(ProxyError::Io(e))
            }
            Err(_) => {
                warn!(addr, "connect to upstream timed out");
                guard.state = ConnState::Cooldown;
                guard.last_failed_connect_at = Some(Instant::now());
                Err(ProxyError::ConnectTimeout {
                    host: self.config.host.clone(),
                    port: self.config.port,
                    timeout_secs: self.config.connect_timeout.as_secs(),
                })
            }
        }
    }

    fn disconnect_locked(&self, guard: &mut Inner) {
        if guard.stream.take().is_some() {
            debug!(host = %self.config.host, port = self.config.port, "disconnected from upstream");
        }
        guard.state = ConnState::Idle;
    }

    /// Force a disconnect, e.g. when the proxy is shutting down.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        self.disconnect_locked(&mut guard);
    }

    /// Total requests sent to this upstream since the client was
    /// created, regardless of whether they were answered.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn echo_frame() -> Vec<u8> {
        use crc::{CRC_32_ISO_HDLC, Crc};
        const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let payload = b"<PassportMsg><POSSequenceID>X</POSSequenceID></PassportMsg>".to_vec();
        let mut buf = Vec::new();
        buf.extend_from_slice(passport_protocol::SIGNATURE);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let header_crc = CRC32.checksum(&buf[0..24]);
        buf.extend_from_slice(&header_crc.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if socket.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn connects_and_echoes_a_request() {
        let addr = spawn_echo_server().await;
        let config = UpstreamConfig::new(addr.ip().to_string(), addr.port(), vec![]);
        let client = UpstreamClient::new(config);

        let frame = echo_frame();
        let response = client.send_and_wait_response(&frame).await.unwrap();
        assert_eq!(response, frame);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn connect_failure_enters_cooldown() {
        let config = UpstreamConfig::new("127.0.0.1".to_string(), 1, vec![]);
        let client = UpstreamClient::new(config);
        let err = client.send_and_wait_response(&echo_frame()).await;
        assert!(err.is_err());

        let err2 = client.send_and_wait_response(&echo_frame()).await;
        assert!(matches!(err2, Err(ProxyError::RetryCooldown { .. })));
    }

    #[tokio::test]
    async fn matches_card_checks_prefix_masks() {
        let config = UpstreamConfig::new(
            "127.0.0.1".to_string(),
            1,
            vec!["1234".to_string(), "5678".to_string()],
        );
        let client = UpstreamClient::new(config);
        assert!(client.matches_card("1234567890"));
        assert!(client.matches_card("5678000000"));
        assert!(!client.matches_card("9999999999"));
    }

    #[tokio::test]
    async fn matches_card_is_false_with_no_masks_configured() {
        let config = UpstreamConfig::new("127.0.0.1".to_string(), 1, vec![]);
        let client = UpstreamClient::new(config);
        assert!(!client.matches_card("1234567890"));
    }
}
