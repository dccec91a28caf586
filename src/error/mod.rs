use std::any::Any;
use std::sync::Arc;
use std::{error::Error, fmt};

const ERR_MSG_REJECTED: &str = "task rejected: scheduler is shut down";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_NOT_COMPLETED: &str = "callback dropped without a result";
const ERR_MSG_PANIC: &str = "panic (unknown type)";

/// Where an [`RxError`] originated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Evaluating a lazily constructed initial value failed.
    Source,
    /// A user callback passed to an operator failed.
    Operator,
    /// An error produced by a dependency (`exception`, future bridge, ...).
    Upstream,
    /// A task was submitted to a scheduler that has been shut down.
    Rejected,
    /// A `timeout` operator fired before the upstream terminated.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Source => write!(f, "source error"),
            ErrorKind::Operator => write!(f, "operator error"),
            ErrorKind::Upstream => write!(f, "upstream error"),
            ErrorKind::Rejected => write!(f, "scheduler rejection"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error carried by [`Event::Error`](crate::event::Event::Error).
///
/// Cheap to clone, so one failure can be replayed to many subscribers
/// (`cache`, `join`, variables). The original cause stays reachable
/// through [`RxError::downcast_ref`] for type based recovery.
#[derive(Clone)]
pub struct RxError {
    kind: ErrorKind,
    cause: Arc<anyhow::Error>,
}

impl RxError {
    /// Wraps an error raised by a dependency.
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::with_kind(ErrorKind::Upstream, anyhow::Error::new(err))
    }

    pub fn msg(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::with_kind(ErrorKind::Upstream, anyhow::Error::msg(msg))
    }

    pub fn with_kind(kind: ErrorKind, cause: anyhow::Error) -> Self {
        Self {
            kind,
            cause: Arc::new(cause),
        }
    }

    pub fn failed_source(cause: anyhow::Error) -> Self {
        Self::with_kind(ErrorKind::Source, cause)
    }

    pub fn failed_operator(cause: anyhow::Error) -> Self {
        Self::with_kind(ErrorKind::Operator, cause)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::with_kind(ErrorKind::Timeout, anyhow::Error::new(TimeoutError { after }))
    }

    pub fn not_completed() -> Self {
        Self::with_kind(ErrorKind::Upstream, anyhow::Error::msg(ERR_MSG_NOT_COMPLETED))
    }

    /// Converts a panic payload caught by `catch_unwind`.
    pub fn from_panic(kind: ErrorKind, payload: Box<dyn Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| ERR_MSG_PANIC.into());
        Self::with_kind(kind, anyhow::Error::new(PanicError { msg }))
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Returns true if the underlying cause is an `E`.
    #[inline]
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.cause.is::<E>()
    }

    #[inline]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.cause.downcast_ref::<E>()
    }
}

impl fmt::Debug for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxError")
            .field("kind", &self.kind)
            .field("cause", &format_args!("{:#}", self.cause))
            .finish()
    }
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.kind, self.cause)
    }
}

impl Error for RxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(AsRef::<dyn Error + 'static>::as_ref(&*self.cause))
    }
}

impl From<anyhow::Error> for RxError {
    fn from(err: anyhow::Error) -> Self {
        Self::with_kind(ErrorKind::Upstream, err)
    }
}

impl From<ScheduleError> for RxError {
    fn from(err: ScheduleError) -> Self {
        Self::with_kind(ErrorKind::Rejected, anyhow::Error::new(err))
    }
}

/// Cause attached to [`ErrorKind::Timeout`] errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimeoutError {
    pub after: std::time::Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ERR_MSG_TIMEOUT} after {:?}", self.after)
    }
}

impl Error for TimeoutError {}

/// Cause attached to errors converted from a caught panic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PanicError {
    pub msg: String,
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.msg)
    }
}

impl Error for PanicError {}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScheduleError {
    Rejected { scheduler: String },
}

impl ScheduleError {
    pub fn rejected(scheduler: impl Into<String>) -> Self {
        ScheduleError::Rejected {
            scheduler: scheduler.into(),
        }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Rejected { scheduler } => write!(f, "{ERR_MSG_REJECTED} ({scheduler})"),
        }
    }
}

impl Error for ScheduleError {}
