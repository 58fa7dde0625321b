//! Dispatcher: candidate selection and the first-wins race across
//! upstream clients for a single POS message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use passport_protocol::{Classification, HandlingMode};
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::session::SessionStore;
use crate::upstream::UpstreamClient;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A single dispatch attempt: the frame as classified, plus the
/// candidate set it was routed to. Kept around for logging.
pub struct DispatchedMessage {
    pub mode: HandlingMode,
    pub candidate_count: usize,
}

/// Routes a classified Passport message to the right upstream(s) and
/// races for the first usable answer.
pub struct Dispatcher {
    upstreams: Vec<Arc<UpstreamClient>>,
    session_store: Arc<SessionStore>,
}

impl Dispatcher {
    pub fn new(upstreams: Vec<Arc<UpstreamClient>>, session_store: Arc<SessionStore>) -> Self {
        Self {
            upstreams,
            session_store,
        }
    }

    /// Classify `frame`, resolve the candidate upstream set (consulting
    /// the session store for `SessionUnicast`), dispatch, and — for a
    /// winning response that carries its own session id — record the
    /// session-to-card binding captured at dispatch time.
    ///
    /// Returns `Ok(None)` for fire-and-forget message kinds
    /// ([`HandlingMode::MulticastNoResponse`]) once every candidate has
    /// been sent the frame. Otherwise returns the first accepted
    /// response.
    pub async fn dispatch(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, ProxyError> {
        let classification = passport_protocol::classify(frame)?;
        // Only an *original* CardUnicast classification captures a card
        // id to bind later — a SessionUnicast message that happens to
        // resolve to a card below does not, matching the reference's
        // `message_type == CARD_BASED_UNICAST` guard.
        let captured_user_id = (classification.mode == HandlingMode::CardUnicast)
            .then(|| classification.routing_key.clone())
            .flatten();

        let (effective_mode, card_id) = self.resolve(&classification).await?;
        let candidates = self.get_valid_clients(effective_mode, card_id.as_deref());

        let dispatched = DispatchedMessage {
            mode: effective_mode,
            candidate_count: candidates.len(),
        };
        info!(
            mode = ?dispatched.mode,
            candidates = dispatched.candidate_count,
            "dispatching message"
        );

        if candidates.is_empty() {
            return Err(ProxyError::DispatchExhausted);
        }

        match effective_mode {
            HandlingMode::MulticastNoResponse => {
                self.fire_and_forget(frame, candidates);
                Ok(None)
            }
            _ => {
                let response =
                    tokio::time::timeout(DISPATCH_TIMEOUT, self.race(frame, candidates))
                        .await
                        .map_err(|_| ProxyError::DispatchExhausted)??;

                if let Some(user_id) = captured_user_id.as_deref() {
                    if let Some(session_id) = passport_protocol::classify(&response)?.session_id {
                        self.session_store.put(&session_id, user_id).await?;
                    }
                }

                Ok(Some(response))
            }
        }
    }

    /// Resolve the classification into the mode actually used for
    /// routing and, when relevant, the card id candidates are matched
    /// against.
    ///
    /// A `SessionUnicast` message whose session has no binding yet
    /// downgrades to `DefaultUnicast` — a real reassignment, not a
    /// no-op comparison.
    async fn resolve(
        &self,
        classification: &Classification,
    ) -> Result<(HandlingMode, Option<String>), ProxyError> {
        match classification.mode {
            HandlingMode::CardUnicast => {
                Ok((HandlingMode::CardUnicast, classification.routing_key.clone()))
            }
            HandlingMode::SessionUnicast => {
                let session_id = classification
                    .session_id
                    .as_deref()
                    .expect("SessionUnicast classification always carries a session id");
                match self.session_store.get(session_id).await? {
                    Some(card_id) => Ok((HandlingMode::CardUnicast, Some(card_id))),
                    None => {
                        debug!(session_id, "no session binding yet, downgrading to default");
                        Ok((HandlingMode::DefaultUnicast, None))
                    }
                }
            }
            other => Ok((other, None)),
        }
    }

    /// Returns the candidate set for `mode`. For `CardUnicast` this is
    /// at most a single client: the first upstream whose mask list
    /// matches `card_id`, or — if none match — the first configured
    /// upstream as the default. It is never empty as long as at least
    /// one upstream is configured, matching the reference's
    /// `client_candidates[:1]` / `self.clients[:1]` fallback.
    fn get_valid_clients(
        &self,
        mode: HandlingMode,
        card_id: Option<&str>,
    ) -> Vec<Arc<UpstreamClient>> {
        match mode {
            HandlingMode::CardUnicast => {
                let card_id = card_id.expect("CardUnicast always carries a card id");
                self.upstreams
                    .iter()
                    .find(|u| u.matches_card(card_id))
                    .or_else(|| self.upstreams.first())
                    .cloned()
                    .into_iter()
                    .collect()
            }
            HandlingMode::DefaultUnicast => self.upstreams.first().cloned().into_iter().collect(),
            HandlingMode::MulticastWithResponse | HandlingMode::MulticastNoResponse => {
                self.upstreams.clone()
            }
            HandlingMode::SessionUnicast => {
                unreachable!("resolve() never returns SessionUnicast")
            }
        }
    }

    /// Write `frame` to every candidate without ever reading a
    /// response — `MulticastNoResponse` messages never produce
    /// anything the POS would see, so there is nothing to race.
    fn fire_and_forget(&self, frame: &[u8], candidates: Vec<Arc<UpstreamClient>>) {
        for client in candidates {
            let frame = frame.to_vec();
            tokio::spawn(async move {
                if let Err(e) = client.send(&frame).await {
                    warn!(host = client.host(), error = %e, "fire-and-forget send failed");
                }
            });
        }
    }

    /// Race every candidate concurrently; return the first response
    /// whose sequence id matches the request. Losing tasks keep
    /// running to completion rather than being cancelled, since
    /// aborting mid-write could leave an upstream's single-flight lock
    /// stuck.
    async fn race(
        &self,
        frame: &[u8],
        candidates: Vec<Arc<UpstreamClient>>,
    ) -> Result<Vec<u8>, ProxyError> {
        let answered = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = tokio::sync::mpsc::channel(candidates.len().max(1));

        for client in candidates {
            let frame = frame.to_vec();
            let answered = answered.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client.send_and_wait_response(&frame).await;
                let outcome = match result {
                    Ok(response) => match passport_protocol::sequences_match(&frame, &response) {
                        Ok(true) => Ok(response),
                        Ok(false) => Err(ProxyError::SequenceMismatch),
                        Err(e) => Err(ProxyError::from(e)),
                    },
                    Err(e) => Err(e),
                };
                if outcome.is_ok()
                    && answered
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    let _ = tx.send(outcome).await;
                } else if outcome.is_err() {
                    debug!(host = client.host(), "candidate did not answer");
                    let _ = tx.send(outcome).await;
                }
            });
        }
        drop(tx);

        let mut last_err: Option<ProxyError> = None;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            debug!(error = %e, "last candidate failure before giving up");
        }
        Err(ProxyError::DispatchExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn frame_for(xml: &str) -> Vec<u8> {
        use crc::{CRC_32_ISO_HDLC, Crc};
        const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let payload = xml.as_bytes();
        let mut buf = Vec::new();
        buf.extend_from_slice(passport_protocol::SIGNATURE);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&CRC32.checksum(payload).to_le_bytes());
        let header_crc = CRC32.checksum(&buf[0..24]);
        buf.extend_from_slice(&header_crc.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
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
            }
        });
        addr
    }

    async fn dispatcher_with_one_echo_upstream(masks: Vec<String>) -> (Dispatcher, tempfile::TempDir) {
        let addr = spawn_echo_server().await;
        let config = UpstreamConfig::new(addr.ip().to_string(), addr.port(), masks);
        let client = Arc::new(UpstreamClient::new(config));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open_at(&dir.path().join("s.db")).unwrap());
        (Dispatcher::new(vec![client], store), dir)
    }

    #[tokio::test]
    async fn card_unicast_routes_to_matching_upstream() {
        let (dispatcher, _dir) =
            dispatcher_with_one_echo_upstream(vec!["4250".to_string()]).await;
        let xml = "<PassportMsg><LoyaltyID>4250011122</LoyaltyID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        let frame = frame_for(xml);
        let response = dispatcher.dispatch(&frame).await.unwrap();
        assert_eq!(response, Some(frame));
    }

    #[tokio::test]
    async fn card_unicast_with_no_matching_upstream_falls_back_to_default() {
        let (dispatcher, _dir) =
            dispatcher_with_one_echo_upstream(vec!["9999".to_string()]).await;
        let xml = "<PassportMsg><LoyaltyID>4250011122</LoyaltyID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        let frame = frame_for(xml);
        let response = dispatcher.dispatch(&frame).await.unwrap();
        assert_eq!(response, Some(frame));
    }

    #[tokio::test]
    async fn session_unicast_downgrades_to_default_without_a_binding() {
        let (dispatcher, _dir) =
            dispatcher_with_one_echo_upstream(vec!["4250".to_string()]).await;
        let xml =
            "<PassportMsg><LoyaltySequenceID>SESS-X</LoyaltySequenceID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        let frame = frame_for(xml);
        let response = dispatcher.dispatch(&frame).await.unwrap();
        assert_eq!(response, Some(frame));
    }

    #[tokio::test]
    async fn session_unicast_routes_to_the_bound_card_upstream() {
        let (dispatcher, _dir) =
            dispatcher_with_one_echo_upstream(vec!["4250".to_string()]).await;

        let card_xml = "<PassportMsg><LoyaltyID>4250011122</LoyaltyID><LoyaltySequenceID>SESS-Y</LoyaltySequenceID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        dispatcher.dispatch(&frame_for(card_xml)).await.unwrap();

        let session_xml = "<PassportMsg><LoyaltySequenceID>SESS-Y</LoyaltySequenceID><POSSequenceID>S2</POSSequenceID></PassportMsg>";
        let frame = frame_for(session_xml);
        let response = dispatcher.dispatch(&frame).await.unwrap();
        assert_eq!(response, Some(frame));
    }

    #[tokio::test]
    async fn multicast_no_response_returns_none_immediately() {
        let (dispatcher, _dir) = dispatcher_with_one_echo_upstream(vec![]).await;
        let xml = "<PassportMsg><BeginCustomerRequest/><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        let frame = frame_for(xml);
        let response = dispatcher.dispatch(&frame).await.unwrap();
        assert_eq!(response, None);
    }

    #[tokio::test]
    async fn no_upstreams_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open_at(&dir.path().join("s.db")).unwrap());
        let dispatcher = Dispatcher::new(vec![], store);
        let xml = "<PassportMsg><SomeOtherField>x</SomeOtherField><POSSequenceID>S1</POSSequenceID></PassportMsg>";
        let err = dispatcher.dispatch(&frame_for(xml)).await.unwrap_err();
        assert!(matches!(err, ProxyError::DispatchExhausted));
    }
}
