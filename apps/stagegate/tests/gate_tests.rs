//! Integration tests for the gate transport, driving both ends directly.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use stagegate::{GateClient, GateListener, RetryPolicy};
use stagegate_core::{
    CorrelationId, GateError, GatePaths, Stage, StageResult, StartToken, decode_result,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

const PROMPT: Duration = Duration::from_secs(5);

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

fn id(s: &str) -> CorrelationId {
    CorrelationId::new(s).unwrap()
}

// =============================================================================
// EXCHANGE
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn one_exchange_carries_token_and_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Config, PROMPT).unwrap();

    let mut client = GateClient::connect(dir.path(), Stage::Config, Some(id("77-0")), &retry())
        .await
        .unwrap();
    let token = client.start_token();
    client.send_token(&token).await.unwrap();

    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    assert_eq!(request.token.unwrap().correlation, Some(id("77-0")));

    let result = StageResult::failure("cc_users: groupadd failed\nsee log", 4);
    request.reply.send_result(&result).await.unwrap();

    assert_eq!(client.receive_result().await.unwrap(), result);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_can_only_be_sent_once() {
    let dir = tempfile::tempdir().unwrap();
    let _gate = GateListener::open(dir.path(), Stage::Local, PROMPT).unwrap();

    let mut client = GateClient::connect(dir.path(), Stage::Local, None, &retry())
        .await
        .unwrap();
    client.send_token(&StartToken::anonymous()).await.unwrap();
    assert!(matches!(
        client.send_token(&StartToken::anonymous()).await,
        Err(GateError::ProtocolViolation(_))
    ));
}

// =============================================================================
// PAIRING
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn orphaned_return_connections_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Network, PROMPT).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Network);

    // A requester that gave up, and one waiting for somebody else's result.
    drop(UnixStream::connect(&paths.ret).await.unwrap());
    let mut stranger = UnixStream::connect(&paths.ret).await.unwrap();
    stranger.write_all(b"someone-else\n").await.unwrap();

    let mut client = GateClient::connect(dir.path(), Stage::Network, Some(id("1-1")), &retry())
        .await
        .unwrap();
    let token = client.start_token();
    client.send_token(&token).await.unwrap();

    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    request.reply.send_result(&StageResult::done()).await.unwrap();

    assert_eq!(client.receive_result().await.unwrap(), StageResult::done());

    // EOF or reset once the gate goes, either way nothing was delivered to it.
    drop(gate);
    let mut leftover = Vec::new();
    let _ = stranger.read_to_end(&mut leftover).await;
    assert!(leftover.is_empty(), "stranger must not get the result");
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_request_leaves_waiting_return_connection_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Network, PROMPT).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Network);

    // A shim between its hello and its request, then a request that hangs up.
    let mut ret = UnixStream::connect(&paths.ret).await.unwrap();
    ret.write_all(b"42-0\n").await.unwrap();
    drop(UnixStream::connect(&paths.request).await.unwrap());

    let err = timeout(PROMPT, gate.receive_token())
        .await
        .unwrap()
        .expect_err("no token was sent");
    assert!(matches!(err, GateError::MalformedMessage(_)), "{:?}", err);

    let mut req = UnixStream::connect(&paths.request).await.unwrap();
    req.write_all(b"start 42-0\n").await.unwrap();
    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    assert_eq!(request.token.unwrap().correlation, Some(id("42-0")));
    request.reply.send_result(&StageResult::done()).await.unwrap();

    let mut frame = Vec::new();
    ret.read_to_end(&mut frame).await.unwrap();
    assert_eq!(decode_result(&frame).unwrap(), StageResult::done());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_token_never_takes_an_identified_return_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate =
        GateListener::open(dir.path(), Stage::Config, Duration::from_millis(200)).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Config);

    let mut ret = UnixStream::connect(&paths.ret).await.unwrap();
    ret.write_all(b"7-1\n").await.unwrap();
    let mut garbage = UnixStream::connect(&paths.request).await.unwrap();
    garbage.write_all(b"begin\n").await.unwrap();

    let err = timeout(PROMPT, gate.receive_token())
        .await
        .unwrap()
        .expect_err("no anonymous return connection to answer on");
    assert!(matches!(err, GateError::ProtocolViolation(_)), "{:?}", err);

    let mut req = UnixStream::connect(&paths.request).await.unwrap();
    req.write_all(b"start 7-1\n").await.unwrap();
    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    assert_eq!(request.token.unwrap().correlation, Some(id("7-1")));
    request.reply.send_result(&StageResult::done()).await.unwrap();

    let mut frame = Vec::new();
    ret.read_to_end(&mut frame).await.unwrap();
    assert_eq!(decode_result(&frame).unwrap(), StageResult::done());
}

#[tokio::test(flavor = "multi_thread")]
async fn interleaved_requesters_each_get_their_own_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Config, PROMPT).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Config);

    // A announces itself, then B runs a whole exchange before A's token.
    let mut first_ret = UnixStream::connect(&paths.ret).await.unwrap();
    first_ret.write_all(b"10-0\n").await.unwrap();

    let mut second = GateClient::connect(dir.path(), Stage::Config, Some(id("20-0")), &retry())
        .await
        .unwrap();
    let token = second.start_token();
    second.send_token(&token).await.unwrap();

    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    assert_eq!(request.token.unwrap().correlation, Some(id("20-0")));
    request.reply.send_result(&StageResult::done()).await.unwrap();
    assert_eq!(second.receive_result().await.unwrap(), StageResult::done());

    let mut first_req = UnixStream::connect(&paths.request).await.unwrap();
    first_req.write_all(b"start 10-0\n").await.unwrap();
    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    assert_eq!(request.token.unwrap().correlation, Some(id("10-0")));
    let rejection = StageResult::protocol_violation("config stage already completed");
    request.reply.send_result(&rejection).await.unwrap();

    let mut frame = Vec::new();
    first_ret.read_to_end(&mut frame).await.unwrap();
    assert_eq!(decode_result(&frame).unwrap(), rejection);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_token_is_answered_on_return_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Final, PROMPT).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Final);

    let mut ret = UnixStream::connect(&paths.ret).await.unwrap();
    ret.write_all(b"\n").await.unwrap();
    let mut req = UnixStream::connect(&paths.request).await.unwrap();
    req.write_all(b"begin\n").await.unwrap();

    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    let err = request.token.expect_err("malformed");
    assert!(matches!(err, GateError::MalformedMessage(_)));

    request
        .reply
        .send_result(&StageResult::protocol_violation(err.to_string()))
        .await
        .unwrap();

    let mut frame = Vec::new();
    ret.read_to_end(&mut frame).await.unwrap();
    let result = decode_result(&frame).unwrap();
    assert_eq!(result.exit_code, 2);
    assert!(result.message.contains("begin"));
}

#[tokio::test(flavor = "multi_thread")]
async fn token_without_return_connection_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Local, Duration::from_millis(200)).unwrap();
    let paths = GatePaths::for_stage(dir.path(), Stage::Local);

    let mut req = UnixStream::connect(&paths.request).await.unwrap();
    req.write_all(b"start\n").await.unwrap();

    let err = timeout(PROMPT, gate.receive_token())
        .await
        .expect("bounded by the token timeout")
        .expect_err("nobody to answer");
    assert!(matches!(err, GateError::ProtocolViolation(_)));
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn closing_gate_resets_waiting_client() {
    let dir = tempfile::tempdir().unwrap();
    let gate = GateListener::open(dir.path(), Stage::Config, PROMPT).unwrap();
    let paths = gate.paths().clone();

    let mut client = GateClient::connect(dir.path(), Stage::Config, Some(id("9-9")), &retry())
        .await
        .unwrap();
    let token = client.start_token();
    client.send_token(&token).await.unwrap();

    gate.close();
    assert!(!paths.request.exists());
    assert!(!paths.ret.exists());

    let err = timeout(PROMPT, client.receive_result())
        .await
        .expect("fails fast")
        .expect_err("gate is gone");
    assert!(matches!(err, GateError::ConnectionReset(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_reply_resets_waiting_client() {
    let dir = tempfile::tempdir().unwrap();
    let mut gate = GateListener::open(dir.path(), Stage::Network, PROMPT).unwrap();

    let mut client = GateClient::connect(dir.path(), Stage::Network, None, &retry())
        .await
        .unwrap();
    client.send_token(&StartToken::anonymous()).await.unwrap();

    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    drop(request);

    let err = timeout(PROMPT, client.receive_result())
        .await
        .expect("fails fast")
        .expect_err("no result");
    assert!(matches!(err, GateError::ConnectionReset(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_waits_for_late_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().to_path_buf();

    let client = tokio::spawn(async move {
        let mut client = GateClient::connect(&run_dir, Stage::Local, None, &retry()).await?;
        client.send_token(&StartToken::anonymous()).await?;
        client.receive_result().await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut gate = GateListener::open(dir.path(), Stage::Local, PROMPT).unwrap();
    let request = timeout(PROMPT, gate.receive_token()).await.unwrap().unwrap();
    request.reply.send_result(&StageResult::done()).await.unwrap();

    let result = timeout(PROMPT, client).await.unwrap().unwrap().unwrap();
    assert_eq!(result, StageResult::done());
}
