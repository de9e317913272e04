//! # Gate Transport
//!
//! Unix stream sockets carrying one request/return exchange per stage.
//!
//! ```text
//!   shim                                   coordinator
//!    │ connect <stage>-return.sock ──────────▶ (backlog)
//!    │ "<id>\n"                                 │
//!    │ connect <stage>.sock ────────────────▶ accept
//!    │ "start <id>\n" ───────────────────────▶ read token
//!    │                                        accept return, match <id>
//!    │                                        run stage
//!    │ ◀──────────────────── "<message>\n<code>\n", close
//! ```
//!
//! The coordinator owns both listeners. The shim connects to the return
//! endpoint *before* sending its token, so by the time the coordinator looks
//! for a return connection it is already queued. Return connections accepted
//! while looking for another requester are held until their own token
//! arrives. Closing the listeners (or dropping an accepted return connection)
//! is what a waiting shim observes as `ConnectionReset`.

use stagegate_core::{
    CorrelationId, GateError, GatePaths, MAX_LINE_LEN, MAX_RESULT_LEN, Stage, StageResult,
    StartToken, decode_hello, decode_result, decode_token, encode_hello, encode_result,
    encode_token,
};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{Instant, timeout, timeout_at};

/// Mode of the gate socket files.
const SOCKET_MODE: u32 = 0o600;

/// Mode of a run directory created by the coordinator.
const RUN_DIR_MODE: u32 = 0o700;

/// Return connections held for requesters whose token has not arrived yet.
const MAX_HELD_RETURNS: usize = 32;

// =============================================================================
// COORDINATOR SIDE
// =============================================================================

/// The coordinator's end of one stage gate: both listeners.
///
/// Dropping the listener removes both socket files.
#[derive(Debug)]
pub struct GateListener {
    paths: GatePaths,
    request: UnixListener,
    ret: UnixListener,
    token_timeout: Duration,
    held: ReturnBacklog,
}

/// A start request paired with the connection its result must go to.
///
/// `token` is an error when the request line could not be decoded; the
/// reply connection is still available so the requester learns why.
#[derive(Debug)]
pub struct GateRequest {
    pub token: Result<StartToken, GateError>,
    pub reply: ReturnHandle,
}

/// Write half of one accepted return connection.
#[derive(Debug)]
pub struct ReturnHandle {
    stage: Stage,
    stream: UnixStream,
}

impl GateListener {
    /// Bind the request and return endpoints of `stage` under `run_dir`.
    ///
    /// Stale socket files from a previous boot are removed first.
    pub fn open(run_dir: &Path, stage: Stage, token_timeout: Duration) -> Result<Self, GateError> {
        prepare_run_dir(run_dir)?;

        let paths = GatePaths::for_stage(run_dir, stage);
        let request = bind(&paths.request)?;
        let ret = match bind(&paths.ret) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_file(&paths.request);
                return Err(e);
            }
        };

        tracing::debug!(
            stage = %stage,
            request = %paths.request.display(),
            ret = %paths.ret.display(),
            "Gate open"
        );

        Ok(Self {
            paths,
            request,
            ret,
            token_timeout,
            held: ReturnBacklog::default(),
        })
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.paths.stage
    }

    #[must_use]
    pub fn paths(&self) -> &GatePaths {
        &self.paths
    }

    /// Wait for the next start request and pair it with its return connection.
    ///
    /// Blocks until a requester connects; callers select against shutdown.
    /// Once a request connection is accepted, reading the token and finding
    /// the return connection are bounded by the token timeout.
    ///
    /// A request that hangs up or stays silent never touches the return
    /// connections. A line that does not decode is answered only on an
    /// anonymous return connection.
    pub async fn receive_token(&mut self) -> Result<GateRequest, GateError> {
        let (stream, _) = self
            .request
            .accept()
            .await
            .map_err(|e| GateError::Io(format!("{} request accept: {}", self.stage(), e)))?;

        let deadline = Instant::now() + self.token_timeout;
        let token = match timeout_at(deadline, read_line(stream)).await {
            Ok(Ok(Some(line))) => decode_token(&line),
            Ok(Ok(None)) => {
                return Err(GateError::MalformedMessage(
                    "request closed without a token".to_string(),
                ));
            }
            Ok(Err(e @ GateError::MalformedMessage(_))) => Err(e),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(GateError::MalformedMessage(
                    "timed out waiting for token".to_string(),
                ));
            }
        };

        let wanted = token.as_ref().ok().and_then(|t| t.correlation.clone());
        let reply = self.pair_return(wanted.as_ref(), deadline).await?;

        Ok(GateRequest { token, reply })
    }

    /// Find the return connection announcing `wanted` (`None` = anonymous).
    ///
    /// Held connections are checked first. Newly accepted connections that
    /// belong to someone else are held for their own token; those whose peer
    /// hung up before the hello are dropped.
    async fn pair_return(
        &mut self,
        wanted: Option<&CorrelationId>,
        deadline: Instant,
    ) -> Result<ReturnHandle, GateError> {
        if let Some(reader) = self.held.take(wanted) {
            return Ok(ReturnHandle {
                stage: self.stage(),
                stream: reader.into_inner(),
            });
        }

        loop {
            let accepted = timeout_at(deadline, self.ret.accept()).await.map_err(|_| {
                GateError::ProtocolViolation(format!(
                    "{} stage: no return connection for start request",
                    self.stage()
                ))
            })?;
            let (stream, _) = accepted
                .map_err(|e| GateError::Io(format!("{} return accept: {}", self.stage(), e)))?;

            let mut reader = BufReader::new(stream);
            let hello = match timeout_at(deadline, read_hello(&mut reader)).await {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    tracing::warn!(stage = %self.stage(), error = %e, "Dropping return connection");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(stage = %self.stage(), "Return connection sent no hello");
                    continue;
                }
            };

            if hello.as_ref() == wanted {
                return Ok(ReturnHandle {
                    stage: self.stage(),
                    stream: reader.into_inner(),
                });
            }

            tracing::debug!(
                stage = %self.stage(),
                wanted = ?wanted.map(CorrelationId::as_str),
                got = ?hello.as_ref().map(CorrelationId::as_str),
                "Holding return connection for a later request"
            );
            if !self.held.hold(hello, reader) {
                tracing::warn!(
                    stage = %self.stage(),
                    held = MAX_HELD_RETURNS,
                    "Too many unclaimed return connections, dropping one"
                );
            }
        }
    }

    /// Close both endpoints and remove their socket files.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for GateListener {
    fn drop(&mut self) {
        for path in self.paths.both() {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove gate socket");
                }
                _ => {}
            }
        }
        tracing::debug!(stage = %self.paths.stage, "Gate closed");
    }
}

/// Return connections that announced themselves before their token arrived.
#[derive(Default)]
struct ReturnBacklog {
    by_id: HashMap<CorrelationId, BufReader<UnixStream>>,
    anonymous: VecDeque<BufReader<UnixStream>>,
}

impl ReturnBacklog {
    fn take(&mut self, wanted: Option<&CorrelationId>) -> Option<BufReader<UnixStream>> {
        self.prune();
        match wanted {
            Some(id) => self.by_id.remove(id),
            None => self.anonymous.pop_front(),
        }
    }

    /// Hold `reader` until its token arrives. `false` if it had to be dropped.
    fn hold(&mut self, hello: Option<CorrelationId>, reader: BufReader<UnixStream>) -> bool {
        self.prune();
        if self.len() >= MAX_HELD_RETURNS {
            return false;
        }
        match hello {
            Some(id) => {
                self.by_id.insert(id, reader);
            }
            None => self.anonymous.push_back(reader),
        }
        true
    }

    /// Drop connections whose peer has gone away.
    fn prune(&mut self) {
        self.by_id.retain(|_, reader| still_waiting(reader));
        self.anonymous.retain(still_waiting);
    }

    fn len(&self) -> usize {
        self.by_id.len() + self.anonymous.len()
    }
}

impl std::fmt::Debug for ReturnBacklog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnBacklog")
            .field("by_id", &self.by_id.len())
            .field("anonymous", &self.anonymous.len())
            .finish()
    }
}

/// A waiting requester sends nothing after its hello: readable means EOF,
/// reset or garbage. Relies on readiness the reactor has already observed.
fn still_waiting(reader: &BufReader<UnixStream>) -> bool {
    if !reader.buffer().is_empty() {
        return false;
    }
    let mut scratch = [0u8; 1];
    matches!(
        reader.get_ref().try_read(&mut scratch),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock
    )
}

impl ReturnHandle {
    /// Deliver the result and close the connection.
    pub async fn send_result(mut self, result: &StageResult) -> Result<(), GateError> {
        let frame = encode_result(result);
        self.stream
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| reset_or_io(self.stage, "result write", e))?;
        self.stream
            .shutdown()
            .await
            .map_err(|e| reset_or_io(self.stage, "result shutdown", e))?;
        Ok(())
    }
}

// =============================================================================
// SHIM SIDE
// =============================================================================

/// Bounded retry for reaching a gate that is not listening yet.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (1-based, attempt 1 never sleeps).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(2).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

/// The shim's end of one stage gate.
#[derive(Debug)]
pub struct GateClient {
    stage: Stage,
    correlation: Option<CorrelationId>,
    request: Option<UnixStream>,
    ret: UnixStream,
}

impl GateClient {
    /// Connect to both endpoints of `stage`, retrying while unavailable.
    pub async fn connect(
        run_dir: &Path,
        stage: Stage,
        correlation: Option<CorrelationId>,
        retry: &RetryPolicy,
    ) -> Result<Self, GateError> {
        let paths = GatePaths::for_stage(run_dir, stage);
        let mut attempt = 1;

        loop {
            match Self::connect_once(&paths, correlation.as_ref()).await {
                Ok((request, ret)) => {
                    return Ok(Self {
                        stage,
                        correlation,
                        request: Some(request),
                        ret,
                    });
                }
                Err(e) if e.is_retryable() && attempt < retry.attempts => {
                    attempt += 1;
                    let wait = retry.backoff(attempt);
                    tracing::debug!(
                        stage = %stage,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Gate not ready, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(
        paths: &GatePaths,
        correlation: Option<&CorrelationId>,
    ) -> Result<(UnixStream, UnixStream), GateError> {
        let mut ret = UnixStream::connect(&paths.ret)
            .await
            .map_err(|e| classify_connect(&paths.ret, e))?;
        ret.write_all(encode_hello(correlation).as_bytes())
            .await
            .map_err(|e| reset_or_io(paths.stage, "hello write", e))?;

        let request = UnixStream::connect(&paths.request)
            .await
            .map_err(|e| classify_connect(&paths.request, e))?;

        Ok((request, ret))
    }

    /// The token matching this client's return connection.
    #[must_use]
    pub fn start_token(&self) -> StartToken {
        StartToken {
            correlation: self.correlation.clone(),
        }
    }

    /// Send a start token on the request endpoint. Only one token per client.
    pub async fn send_token(&mut self, token: &StartToken) -> Result<(), GateError> {
        let mut request = self.request.take().ok_or_else(|| {
            GateError::ProtocolViolation(format!("{} start token already sent", self.stage))
        })?;
        request
            .write_all(encode_token(token).as_bytes())
            .await
            .map_err(|e| reset_or_io(self.stage, "token write", e))?;
        request
            .shutdown()
            .await
            .map_err(|e| reset_or_io(self.stage, "token shutdown", e))?;
        Ok(())
    }

    /// Block until the coordinator delivers the stage result.
    ///
    /// No timeout: stages may run for a long time and the supervisor owns
    /// any bound on the wait.
    pub async fn receive_result(self) -> Result<StageResult, GateError> {
        let mut frame = Vec::new();
        self.ret
            .take(MAX_RESULT_LEN as u64 + 1)
            .read_to_end(&mut frame)
            .await
            .map_err(|e| reset_or_io(self.stage, "result read", e))?;

        if frame.is_empty() {
            return Err(GateError::ConnectionReset(format!(
                "{} gate closed before the stage reported a result",
                self.stage
            )));
        }
        decode_result(&frame)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn prepare_run_dir(run_dir: &Path) -> Result<(), GateError> {
    if run_dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(run_dir).map_err(|e| {
        GateError::Io(format!("Cannot create run dir '{}': {}", run_dir.display(), e))
    })?;
    std::fs::set_permissions(run_dir, std::fs::Permissions::from_mode(RUN_DIR_MODE)).map_err(
        |e| GateError::Io(format!("Cannot chmod run dir '{}': {}", run_dir.display(), e)),
    )
}

fn bind(path: &Path) -> Result<UnixListener, GateError> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::warn!(path = %path.display(), "Removed stale gate socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(GateError::Io(format!(
                "Cannot remove stale socket '{}': {}",
                path.display(),
                e
            )));
        }
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| GateError::Io(format!("Bind '{}' failed: {}", path.display(), e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .map_err(|e| GateError::Io(format!("Cannot chmod '{}': {}", path.display(), e)))?;
    Ok(listener)
}

/// Read one protocol line. `None` means the peer closed without sending one.
async fn read_line(stream: UnixStream) -> Result<Option<String>, GateError> {
    let mut reader = BufReader::new(stream);
    read_limited_line(&mut reader).await
}

async fn read_hello(
    reader: &mut BufReader<UnixStream>,
) -> Result<Option<CorrelationId>, GateError> {
    match read_limited_line(reader).await? {
        Some(line) => decode_hello(&line),
        None => Err(GateError::ConnectionReset(
            "return connection closed before hello".to_string(),
        )),
    }
}

async fn read_limited_line(
    reader: &mut BufReader<UnixStream>,
) -> Result<Option<String>, GateError> {
    let mut line = String::new();
    let read = reader
        .take(MAX_LINE_LEN as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidData => GateError::MalformedMessage("line is not UTF-8".to_string()),
            _ => GateError::ConnectionReset(e.to_string()),
        })?;

    if read == 0 {
        return Ok(None);
    }
    if read == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(GateError::MalformedMessage(format!(
            "line exceeds {} bytes",
            MAX_LINE_LEN
        )));
    }
    Ok(Some(line))
}

fn classify_connect(path: &Path, e: std::io::Error) -> GateError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
            GateError::EndpointUnavailable(format!("{}: {}", path.display(), e))
        }
        _ => GateError::Io(format!("Connect '{}' failed: {}", path.display(), e)),
    }
}

fn reset_or_io(stage: Stage, what: &str, e: std::io::Error) -> GateError {
    match e.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => GateError::ConnectionReset(format!("{} {}: {}", stage, what, e)),
        _ => GateError::Io(format!("{} {}: {}", stage, what, e)),
    }
}

/// Whether something accepts connections on `path` within `wait`.
///
/// Only probe return endpoints: the coordinator skips return connections
/// that hang up without a hello, whereas a dead request connection is
/// answered as a malformed start request.
pub async fn probe(path: &Path, wait: Duration) -> bool {
    matches!(timeout(wait, UnixStream::connect(path)).await, Ok(Ok(_)))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(retry.backoff(2), Duration::from_millis(50));
        assert_eq!(retry.backoff(3), Duration::from_millis(100));
        assert_eq!(retry.backoff(4), Duration::from_millis(200));
        assert_eq!(retry.backoff(5), Duration::from_millis(300));
        assert_eq!(retry.backoff(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn open_removes_stale_sockets_and_close_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = GatePaths::for_stage(dir.path(), Stage::Local);
        std::fs::write(&paths.request, b"stale").expect("write stale");

        let gate = GateListener::open(dir.path(), Stage::Local, Duration::from_secs(1))
            .expect("open");
        assert!(paths.request.exists());
        assert!(paths.ret.exists());

        gate.close();
        assert!(!paths.request.exists());
        assert!(!paths.ret.exists());
    }

    #[tokio::test]
    async fn connect_without_coordinator_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let retry = RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let err = GateClient::connect(dir.path(), Stage::Final, None, &retry)
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, GateError::EndpointUnavailable(_)));
    }
}
