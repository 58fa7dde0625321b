//! A mock Passport upstream for dispatcher and listener integration
//! tests: binds an ephemeral port and answers each request according to
//! a configurable [`Behavior`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// How a [`MockUpstream`] answers each request it receives.
#[derive(Clone)]
pub enum Behavior {
    /// Send the request frame straight back.
    Echo,
    /// Wait `delay`, then echo.
    EchoAfter(Duration),
    /// Always answer with this exact frame, ignoring the request.
    Fixed(Vec<u8>),
    /// Read the request and never answer, until the connection closes.
    HangUp,
}

/// A running mock upstream. Dropping this does not stop the server —
/// call [`MockUpstream::stop`] for a clean shutdown.
pub struct MockUpstream {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MockUpstream {
    /// Bind an ephemeral port and start serving with `behavior`.
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local_addr");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, behavior, shutdown_rx));

        Self {
            addr,
            shutdown_tx,
            task,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(listener: TcpListener, behavior: Behavior, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                let Ok((socket, _)) = accepted else { continue };
                let behavior = behavior.clone();
                tokio::spawn(serve_connection(socket, behavior));
            }
        }
    }
}

async fn serve_connection(mut socket: tokio::net::TcpStream, behavior: Behavior) {
    loop {
        let mut header = [0u8; passport_protocol::HEADER_LEN];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let Ok(parsed) = passport_protocol::decode_header(&header) else {
            return;
        };
        let mut payload = vec![0u8; parsed.payload_length as usize];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }
        let mut frame = header.to_vec();
        frame.extend_from_slice(&payload);

        match &behavior {
            Behavior::Echo => {
                if socket.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Behavior::EchoAfter(delay) => {
                tokio::time::sleep(*delay).await;
                if socket.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Behavior::Fixed(response) => {
                if socket.write_all(response).await.is_err() {
                    return;
                }
            }
            Behavior::HangUp => {
                debug!("mock upstream ignoring request per configured behavior");
            }
        }
    }
}

/// Build a well-formed Passport frame with a correct header and
/// payload CRC, for use as test fixtures.
pub fn build_frame(message_kind: u32, payload: &[u8]) -> Vec<u8> {
    use crc::{CRC_32_ISO_HDLC, Crc};
    const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    let mut buf = Vec::with_capacity(passport_protocol::HEADER_LEN + payload.len());
    buf.extend_from_slice(passport_protocol::SIGNATURE);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&message_kind.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&CRC32.checksum(payload).to_le_bytes());
    let header_crc = CRC32.checksum(&buf[0..24]);
    buf.extend_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}
