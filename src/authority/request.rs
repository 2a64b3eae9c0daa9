use crate::notify::{Completion, WaitError};
use crate::packet::{ProcessIdentifier, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Identity of one connection session, used to detach its pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sequence number of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A submitted request and the channel its answer arrives on.
#[derive(Debug)]
pub struct RequestObject<Req, Resp> {
    pub id: RequestId,
    pub request: Arc<Req>,
    completion: Completion<Resp>,
}

impl<Req, Resp> RequestObject<Req, Resp> {
    pub(crate) fn new(id: RequestId, request: Arc<Req>, completion: Completion<Resp>) -> Self {
        Self {
            id,
            request,
            completion,
        }
    }

    /// Wait for the answer, bounded by `timeout`.
    ///
    /// # Errors
    /// See [`Completion::wait`].
    pub async fn response(self, timeout: Duration) -> Result<Resp, WaitError> {
        self.completion.wait(timeout).await
    }

    /// Split into the request and its completion, for callers that race the wait
    /// against their own cancellation signal.
    #[must_use]
    pub fn into_parts(self) -> (RequestId, Arc<Req>, Completion<Resp>) {
        (self.id, self.request, self.completion)
    }
}

/// Bare acknowledgement of a `HELLO`, carrying the new identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub process_identifier: ProcessIdentifier,
}

/// Full result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub process_identifier: ProcessIdentifier,
    pub text: String,
    pub status: StatusCode,
}

/// What the authority answers. Exactly one shape per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityResponse {
    Simple(Acknowledgement),
    Complex(Outcome),
}

impl AuthorityResponse {
    #[must_use]
    pub const fn acknowledge(process_identifier: ProcessIdentifier) -> Self {
        Self::Simple(Acknowledgement { process_identifier })
    }

    #[must_use]
    pub fn outcome(
        process_identifier: ProcessIdentifier,
        status: StatusCode,
        text: impl Into<String>,
    ) -> Self {
        Self::Complex(Outcome {
            process_identifier,
            text: text.into(),
            status,
        })
    }

    /// Answer used when the broker itself failed while handling a request.
    #[must_use]
    pub fn internal_error(process_identifier: ProcessIdentifier) -> Self {
        Self::outcome(process_identifier, StatusCode::Unknown, "Unknown error")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        match self {
            Self::Simple(_) => true,
            Self::Complex(outcome) => outcome.status.is_success(),
        }
    }

    #[must_use]
    pub const fn process_identifier(&self) -> ProcessIdentifier {
        match self {
            Self::Simple(ack) => ack.process_identifier,
            Self::Complex(outcome) => outcome.process_identifier,
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Simple(_) => StatusCode::None,
            Self::Complex(outcome) => outcome.status,
        }
    }
}
