//! # Fetch
//!
//! The two-stage negotiation with the payload server.
//!
//! Stage0 asks whether a payload exists for the game and learns the digest of the payload that
//! will be served for the session salt. Stage1 downloads that payload, possibly after the server
//! reports that it is still preparing it. [`FetchProtocol`] tracks where a session is in this
//! exchange; the network itself sits behind the [`Transport`] trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::crypto::Digest;
use crate::error::{ErrorCode, PayloadError, ProtocolError};
use crate::format::{GameId, Salt, PAYLOAD_BLOCK_SIZE};

#[cfg(feature = "http")]
pub mod http;
pub mod retry;

pub use retry::{cancel_pair, CancelHandle, CancelSignal, RetryPolicy};

/// Default bound for a single request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a session is in the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Nothing sent yet
    Idle,
    /// Stage0 request in flight
    Stage0Requested,
    /// Server has a payload for this game
    Stage0Ok,
    /// Stage1 request in flight, or waiting to be retried
    Stage1Requested,
    /// Payload received
    Stage1Ok,
    /// Session failed with the given code
    Failed(ErrorCode),
}

impl FetchState {
    /// Whether the session cannot make further progress
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stage1Ok | Self::Failed(_))
    }
}

/// Stage0 and stage1 request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Requesting game
    pub game: GameId,
    /// Session salt
    pub salt: Salt,
}

/// Server answer to stage0
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage0Response {
    /// No payload exists for this game
    Missing,
    /// A payload exists; its signed region hashes to `digest`
    Available {
        /// SHA-256 of `[salt..total_size)` of the payload served for this salt
        digest: Digest,
    },
}

/// Server answer to stage1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage1Response {
    /// The payload
    Payload(Vec<u8>),
    /// Not ready yet
    Waiting {
        /// How long the server asked the client to wait
        retry_after: Option<Duration>,
    },
}

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Request could not be sent or the connection failed
    #[error("request failed: {0}")]
    Request(String),
    /// Server answered with an unexpected status or body
    #[error("bad response: {0}")]
    Response(String),
    /// Response body is larger than allowed
    #[error("payload of {size} bytes exceeds the {max} byte buffer")]
    Alloc {
        /// Size the server sent
        size: usize,
        /// Buffer limit
        max: usize,
    },
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Request(reason) => Self::MakeRequest(reason),
            TransportError::Response(reason) => Self::Response(reason),
            TransportError::Alloc { size, max } => Self::Alloc { size, max },
        }
    }
}

/// Request/response exchange with the payload server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Asks whether a payload exists for `request.game`
    async fn stage0(&self, request: &Request) -> Result<Stage0Response, TransportError>;

    /// Requests the payload, refusing bodies larger than `max_size`
    async fn stage1(
        &self,
        request: &Request,
        max_size: usize,
    ) -> Result<Stage1Response, TransportError>;
}

/// One negotiation session
pub struct FetchProtocol<'t> {
    /// Network
    transport: &'t dyn Transport,
    /// Parameters sent with both stages
    request: Request,
    /// Current state
    state: FetchState,
    /// Largest accepted payload
    max_payload_size: usize,
    /// Bound for each request
    request_timeout: Duration,
    /// Host cancellation
    cancel: CancelSignal,
    /// Point after which no request may still be running
    deadline: Option<Instant>,
    /// Digest advertised by stage0
    advertised: Option<Digest>,
    /// Wait requested by the last stage1 answer
    retry_after: Option<Duration>,
}

impl<'t> FetchProtocol<'t> {
    /// Starts a session for `game` bound to `salt`
    pub fn new(transport: &'t dyn Transport, game: GameId, salt: Salt) -> Self {
        Self {
            transport,
            request: Request { game, salt },
            state: FetchState::Idle,
            max_payload_size: PAYLOAD_BLOCK_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: CancelSignal::never(),
            deadline: None,
            advertised: None,
            retry_after: None,
        }
    }

    /// Sets the largest accepted payload
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Sets the bound for each request
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Watches `cancel` during requests
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cuts every request short at `deadline`
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Current state
    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Session salt
    pub fn salt(&self) -> &Salt {
        &self.request.salt
    }

    /// Requesting game
    pub fn game(&self) -> &GameId {
        &self.request.game
    }

    /// Digest advertised by stage0, once it succeeded
    pub fn advertised_digest(&self) -> Option<&Digest> {
        self.advertised.as_ref()
    }

    /// Wait requested by the server with the last `Waiting` answer
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Moves to `Failed` with the code of `error` and hands the error back
    pub fn fail<E: Into<PayloadError>>(&mut self, error: E) -> PayloadError {
        let error = error.into();
        warn!(state = ?self.state, code = error.code().as_i32(), %error, "payload fetch failed");
        self.state = FetchState::Failed(error.code());
        error
    }

    /// Bound for the next request: the request timeout, or less if the deadline is closer
    fn request_budget(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .request_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.request_timeout,
        }
    }

    /// Runs stage0, returning the advertised digest
    pub async fn stage0(&mut self) -> Result<Digest, PayloadError> {
        if self.state != FetchState::Idle {
            return Err(ProtocolError::OutOfOrder.into());
        }
        self.state = FetchState::Stage0Requested;
        debug!(game = %self.request.game, "requesting stage0");

        let response = bounded_call(
            self.request_budget(),
            &mut self.cancel,
            self.transport.stage0(&self.request),
        )
        .await;
        match response {
            Ok(Stage0Response::Available { digest }) => {
                debug!(digest = %hex::encode(digest), "stage0 ok");
                self.advertised = Some(digest);
                self.state = FetchState::Stage0Ok;
                Ok(digest)
            }
            Ok(Stage0Response::Missing) => Err(self.fail(ProtocolError::MissingStage1)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Runs one stage1 attempt
    ///
    /// `Err(ProtocolError::Waiting)` leaves the session in `Stage1Requested` so it can be
    /// attempted again; every other error is terminal.
    pub async fn stage1(&mut self) -> Result<Vec<u8>, PayloadError> {
        if !matches!(
            self.state,
            FetchState::Stage0Ok | FetchState::Stage1Requested
        ) {
            return Err(ProtocolError::OutOfOrder.into());
        }
        self.state = FetchState::Stage1Requested;
        self.retry_after = None;
        debug!(game = %self.request.game, "requesting stage1");

        let response = bounded_call(
            self.request_budget(),
            &mut self.cancel,
            self.transport.stage1(&self.request, self.max_payload_size),
        )
        .await;
        match response {
            Ok(Stage1Response::Payload(bytes)) if bytes.len() > self.max_payload_size => {
                Err(self.fail(ProtocolError::Alloc {
                    size: bytes.len(),
                    max: self.max_payload_size,
                }))
            }
            Ok(Stage1Response::Payload(bytes)) => {
                info!(size = bytes.len(), "received payload");
                self.state = FetchState::Stage1Ok;
                Ok(bytes)
            }
            Ok(Stage1Response::Waiting { retry_after }) => {
                debug!(?retry_after, "server is preparing the payload");
                self.retry_after = retry_after;
                Err(ProtocolError::Waiting.into())
            }
            Err(e) => Err(self.fail(e)),
        }
    }
}

/// Bounds a transport call by time and cancellation, flattening both error layers
async fn bounded_call<T>(
    timeout: Duration,
    cancel: &mut CancelSignal,
    call: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, ProtocolError> {
    retry::bounded(timeout, cancel, call).await?.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    /// Session over `transport` for a fixed game and salt
    fn session(transport: &MockTransport) -> FetchProtocol<'_> {
        FetchProtocol::new(transport, GameId::new("RMCPD00").unwrap(), Salt([7; 32]))
    }

    #[tokio::test]
    async fn test_happy_path() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [1; 32] }))
            .with_stage1(Ok(Stage1Response::Payload(vec![0; 16])));
        let mut fetch = session(&transport);
        assert_eq!(fetch.state(), FetchState::Idle);

        assert_eq!(fetch.stage0().await.unwrap(), [1; 32]);
        assert_eq!(fetch.state(), FetchState::Stage0Ok);
        assert_eq!(fetch.advertised_digest(), Some(&[1; 32]));

        assert_eq!(fetch.stage1().await.unwrap(), vec![0; 16]);
        assert_eq!(fetch.state(), FetchState::Stage1Ok);
        assert!(fetch.state().is_terminal());

        // both stages carry the session salt
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.salt == Salt([7; 32])));
    }

    #[tokio::test]
    async fn test_missing_stage1() {
        let transport = MockTransport::new().with_stage0(Ok(Stage0Response::Missing));
        let mut fetch = session(&transport);
        let err = fetch.stage0().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Stage0MissingStage1);
        assert_eq!(
            fetch.state(),
            FetchState::Failed(ErrorCode::Stage0MissingStage1)
        );
    }

    #[tokio::test]
    async fn test_transport_errors() {
        let cases = [
            (
                TransportError::Request("refused".into()),
                ErrorCode::Stage1MakeRequest,
            ),
            (
                TransportError::Response("500".into()),
                ErrorCode::Stage1Response,
            ),
            (
                TransportError::Alloc { size: 10, max: 5 },
                ErrorCode::Stage1Alloc,
            ),
        ];
        for (error, code) in cases {
            let transport = MockTransport::new()
                .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }))
                .with_stage1(Err(error));
            let mut fetch = session(&transport);
            fetch.stage0().await.unwrap();
            assert_eq!(fetch.stage1().await.unwrap_err().code(), code);
            assert_eq!(fetch.state(), FetchState::Failed(code));
        }
    }

    #[tokio::test]
    /// Waiting keeps the session open for another stage1 attempt
    async fn test_waiting_then_ok() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }))
            .with_stage1(Ok(Stage1Response::Waiting {
                retry_after: Some(Duration::from_secs(3)),
            }))
            .with_stage1(Ok(Stage1Response::Payload(vec![1, 2, 3])));
        let mut fetch = session(&transport);
        fetch.stage0().await.unwrap();

        let err = fetch.stage1().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::Stage1Waiting);
        assert_eq!(fetch.state(), FetchState::Stage1Requested);
        assert_eq!(fetch.retry_after(), Some(Duration::from_secs(3)));

        assert_eq!(fetch.stage1().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(fetch.retry_after(), None);
    }

    #[tokio::test]
    async fn test_oversized_payload() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }))
            .with_stage1(Ok(Stage1Response::Payload(vec![0; 64])));
        let mut fetch = session(&transport).with_max_payload_size(32);
        fetch.stage0().await.unwrap();
        assert_eq!(
            fetch.stage1().await.unwrap_err().code(),
            ErrorCode::Stage1Alloc
        );
    }

    #[tokio::test]
    async fn test_out_of_order() {
        let transport = MockTransport::new();
        let mut fetch = session(&transport);
        assert!(matches!(
            fetch.stage1().await,
            Err(PayloadError::Protocol(ProtocolError::OutOfOrder))
        ));
        assert_eq!(fetch.state(), FetchState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }));
        let (handle, cancel) = cancel_pair();
        handle.cancel();
        let mut fetch = session(&transport).with_cancel(cancel);
        let err = fetch.stage0().await.unwrap_err();
        assert!(matches!(err, PayloadError::Protocol(ProtocolError::Cancelled)));
        assert!(!err.is_retryable());
        assert_eq!(fetch.state(), FetchState::Failed(ErrorCode::Stage1Waiting));
    }
    #[tokio::test(start_paused = true)]
    /// A request still running at the deadline is cut short even if its timeout is longer
    async fn test_deadline_bounds_request() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }))
            .with_stage1(Ok(Stage1Response::Payload(vec![0; 16])))
            .with_stage1_delay(Duration::from_secs(25));
        let started = Instant::now();
        let mut fetch = session(&transport)
            .with_request_timeout(Duration::from_secs(30))
            .with_deadline(Some(started + Duration::from_secs(5)));
        fetch.stage0().await.unwrap();

        let err = fetch.stage1().await.unwrap_err();
        assert!(matches!(err, PayloadError::Protocol(ProtocolError::TimedOut)));
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6),
            "request took {elapsed:?}"
        );
        assert_eq!(fetch.state(), FetchState::Failed(ErrorCode::Stage1Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_without_deadline() {
        let transport = MockTransport::new()
            .with_stage0(Ok(Stage0Response::Available { digest: [0; 32] }))
            .with_stage1(Ok(Stage1Response::Payload(vec![0; 16])))
            .with_stage1_delay(Duration::from_secs(25));
        let started = Instant::now();
        let mut fetch = session(&transport)
            .with_request_timeout(Duration::from_secs(30));
        fetch.stage0().await.unwrap();

        assert_eq!(fetch.stage1().await.unwrap(), vec![0; 16]);
        assert!(started.elapsed() >= Duration::from_secs(25));
    }
}
