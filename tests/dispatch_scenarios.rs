//! End-to-end dispatch scenarios driven against real TCP mock
//! upstreams, exercising the full framing -> classification -> routing
//! -> race path.

use std::sync::Arc;
use std::time::Duration;

use pos_proxy::dispatcher::Dispatcher;
use pos_proxy::error::ProxyError;
use pos_proxy::session::SessionStore;
use pos_proxy::upstream::{UpstreamClient, UpstreamConfig};
use pos_test_utils::{Behavior, MockUpstream, build_frame};

async fn open_session_store() -> (Arc<SessionStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open_at(&dir.path().join("sessions.db")).unwrap();
    (Arc::new(store), dir)
}

fn upstream_client(addr: std::net::SocketAddr, masks: Vec<&str>) -> Arc<UpstreamClient> {
    let config = UpstreamConfig::new(
        addr.ip().to_string(),
        addr.port(),
        masks.into_iter().map(str::to_owned).collect(),
    );
    Arc::new(UpstreamClient::new(config))
}

#[tokio::test]
async fn binary_echo_is_answered_by_every_upstream_and_returns_first_answer() {
    let upstream_a = MockUpstream::start(Behavior::Echo).await;
    let upstream_b = MockUpstream::start(Behavior::Echo).await;
    let (store, _dir) = open_session_store().await;

    let dispatcher = Dispatcher::new(
        vec![
            upstream_client(upstream_a.addr, vec![]),
            upstream_client(upstream_b.addr, vec![]),
        ],
        store,
    );

    let frame = build_frame(2, &[]);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, Some(frame));

    upstream_a.stop().await;
    upstream_b.stop().await;
}

#[tokio::test]
async fn online_status_request_is_multicast_with_response() {
    let upstream = MockUpstream::start(Behavior::Echo).await;
    let (store, _dir) = open_session_store().await;
    let dispatcher = Dispatcher::new(vec![upstream_client(upstream.addr, vec![])], store);

    let xml = b"<PassportMsg><GetLoyaltyOnlineStatusRequest/><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    let frame = build_frame(1, xml);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, Some(frame));

    upstream.stop().await;
}

#[tokio::test]
async fn card_request_routes_to_the_upstream_whose_mask_matches() {
    let store_host = MockUpstream::start(Behavior::Echo).await;
    let other_host = MockUpstream::start(Behavior::Fixed(build_frame(
        1,
        b"<PassportMsg><POSSequenceID>WRONG</POSSequenceID></PassportMsg>",
    )))
    .await;
    let (store, _dir) = open_session_store().await;

    let dispatcher = Dispatcher::new(
        vec![
            upstream_client(other_host.addr, vec!["9999"]),
            upstream_client(store_host.addr, vec!["4250"]),
        ],
        store,
    );

    let xml = b"<PassportMsg><LoyaltyID>4250998877</LoyaltyID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    let frame = build_frame(1, xml);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, Some(frame));

    store_host.stop().await;
    other_host.stop().await;
}

#[tokio::test]
async fn card_request_routes_to_a_different_upstream_when_its_mask_matches() {
    let host_a = MockUpstream::start(Behavior::Echo).await;
    let host_b = MockUpstream::start(Behavior::Echo).await;
    let (store, _dir) = open_session_store().await;

    let dispatcher = Dispatcher::new(
        vec![
            upstream_client(host_a.addr, vec!["1111"]),
            upstream_client(host_b.addr, vec!["2222"]),
        ],
        store,
    );

    let xml = b"<PassportMsg><LoyaltyID>2222334455</LoyaltyID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    let frame = build_frame(1, xml);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, Some(frame));

    host_a.stop().await;
    host_b.stop().await;
}

#[tokio::test]
async fn corrupted_header_crc_is_rejected_before_dispatch() {
    let mut frame = build_frame(1, b"<PassportMsg><POSSequenceID>S1</POSSequenceID></PassportMsg>");
    frame[24] ^= 0xFF;
    let decoded = passport_protocol::decode_header(&frame[0..passport_protocol::HEADER_LEN]);
    assert!(decoded.is_err());
}

#[tokio::test]
async fn begin_customer_is_multicast_with_no_response_expected() {
    let upstream = MockUpstream::start(Behavior::Echo).await;
    let (store, _dir) = open_session_store().await;
    let dispatcher = Dispatcher::new(vec![upstream_client(upstream.addr, vec![])], store);

    let xml = b"<PassportMsg><BeginCustomerRequest/><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    let frame = build_frame(1, xml);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, None);

    upstream.stop().await;
}

#[tokio::test]
async fn session_bound_by_card_request_later_routes_session_only_requests() {
    let upstream = MockUpstream::start(Behavior::Echo).await;
    let (store, _dir) = open_session_store().await;
    let dispatcher = Dispatcher::new(vec![upstream_client(upstream.addr, vec!["4250"])], store);

    let card_xml = b"<PassportMsg><LoyaltyID>4250112233</LoyaltyID><LoyaltySequenceID>SESS-1</LoyaltySequenceID><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    dispatcher.dispatch(&build_frame(1, card_xml)).await.unwrap();

    let session_xml =
        b"<PassportMsg><LoyaltySequenceID>SESS-1</LoyaltySequenceID><POSSequenceID>S2</POSSequenceID></PassportMsg>";
    let frame = build_frame(1, session_xml);
    let response = dispatcher.dispatch(&frame).await.unwrap();
    assert_eq!(response, Some(frame));

    upstream.stop().await;
}

#[tokio::test]
async fn impatient_client_times_out_when_upstream_never_answers() {
    let upstream = MockUpstream::start(Behavior::HangUp).await;
    let (store, _dir) = open_session_store().await;

    let mut config = UpstreamConfig::new(upstream.addr.ip().to_string(), upstream.addr.port(), vec![]);
    config.response_timeout = Duration::from_millis(100);
    let client = Arc::new(UpstreamClient::new(config));
    let dispatcher = Dispatcher::new(vec![client], store);

    let xml = b"<PassportMsg><SomeOtherField>x</SomeOtherField><POSSequenceID>S1</POSSequenceID></PassportMsg>";
    let err = dispatcher.dispatch(&build_frame(1, xml)).await.unwrap_err();
    assert!(matches!(err, ProxyError::DispatchExhausted));

    upstream.stop().await;
}
