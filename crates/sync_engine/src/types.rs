use std::fmt;

use serde_json::Value;
use sync_core::{FaultClass, TaskFailure};

/// One page of a cursor-paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub results: Vec<Value>,
    /// Cursor for the next page; `None` ends the collection.
    pub next: Option<String>,
    /// Total size of the collection, when the remote reports it.
    pub total: Option<u64>,
}

impl Page {
    /// Parses `{results: [...], paging?: {next: {after: cursor}}, total?}`.
    pub fn from_json(body: Value) -> Result<Self, RemoteError> {
        let Value::Object(mut body) = body else {
            return Err(RemoteError::new(
                FailureKind::MalformedBody,
                "page body is not an object",
            ));
        };
        let results = match body.remove("results") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(RemoteError::new(
                    FailureKind::MalformedBody,
                    "`results` is not an array",
                ))
            }
            None => {
                return Err(RemoteError::new(
                    FailureKind::MalformedBody,
                    "page has no `results`",
                ))
            }
        };
        let next = body
            .get("paging")
            .and_then(|paging| paging.get("next"))
            .and_then(|next| next.get("after"))
            .and_then(|after| match after {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let total = body.get("total").and_then(Value::as_u64);
        Ok(Self {
            results,
            next,
            total,
        })
    }
}

/// Pagination state of one job. Pages are fetched strictly in cursor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub after: Option<String>,
    pub has_more: bool,
}

impl PageCursor {
    pub fn start() -> Self {
        Self {
            after: None,
            has_more: true,
        }
    }

    pub fn advance(&self, next: Option<String>) -> Self {
        Self {
            has_more: next.is_some(),
            after: next,
        }
    }
}

/// Whether a remote failure should be retried at the fetch step or surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Propagate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteError {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.kind {
            FailureKind::HttpStatus(429 | 502 | 503 | 504)
            | FailureKind::Timeout
            | FailureKind::Network => Disposition::Retry,
            _ => Disposition::Propagate,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == FailureKind::HttpStatus(404)
    }

    /// The fatal classification used when this error ends a job.
    pub fn fault_class(&self) -> FaultClass {
        match self.kind {
            FailureKind::MalformedBody => FaultClass::MalformedInput,
            _ => FaultClass::Download,
        }
    }
}

impl From<RemoteError> for TaskFailure {
    fn from(err: RemoteError) -> Self {
        TaskFailure::new(err.fault_class(), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    MalformedBody,
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::MalformedBody => write!(f, "malformed body"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}
