//! Failure classification: which errors are worth another attempt.
//!
//! Operations return their own error type; implementing [`Classify`] exposes what the
//! retry conditions look at (an HTTP status, a numeric code, a type name and the
//! `Display` message). [`FailureRecord`] is the type-erased snapshot of a failure that
//! travels in events and dead-letter items.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::ResilienceError;

/// What the retry conditions need to know about an operation error.
///
/// All methods have defaults; the `Display` output is the error message.
pub trait Classify: fmt::Display {
    /// HTTP status carried by the error, if any.
    fn http_status(&self) -> Option<u16> {
        None
    }

    /// Numeric error code. Used as an HTTP status when it lies in `100..=599`.
    fn numeric_code(&self) -> Option<i64> {
        None
    }

    /// Name matched against `RetryConditions::error_types`. Defaults to the unqualified
    /// Rust type name.
    fn type_name(&self) -> Cow<'static, str> {
        let full = std::any::type_name::<Self>();
        Cow::Borrowed(full.rsplit("::").next().unwrap_or(full))
    }
}

impl Classify for String {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("Error")
    }
}

impl Classify for &'static str {
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Borrowed("Error")
    }
}

impl Classify for io::Error {
    fn numeric_code(&self) -> Option<i64> {
        self.raw_os_error().map(i64::from)
    }

    /// The [`io::ErrorKind`], e.g. `ConnectionRefused` or `TimedOut`.
    fn type_name(&self) -> Cow<'static, str> {
        Cow::Owned(format!("{:?}", self.kind()))
    }
}

/// Ready-made classifiable error for operations without an error type of their own.
///
/// ```rust
/// use tollgate::retry::{Classify, OperationError};
///
/// let err = OperationError::new("UpstreamError", "bad gateway").with_status(502);
/// assert_eq!(err.http_status(), Some(502));
/// assert_eq!(err.type_name(), "UpstreamError");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperationError {
    pub kind: String,
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<i64>,
}

impl OperationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), status: None, code: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OperationError {}

impl Classify for OperationError {
    fn http_status(&self) -> Option<u16> {
        self.status
    }

    fn numeric_code(&self) -> Option<i64> {
        self.code
    }

    fn type_name(&self) -> Cow<'static, str> {
        Cow::Owned(self.kind.clone())
    }
}

/// Type-erased description of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailureRecord {
    pub type_name: String,
    pub message: String,
    /// HTTP status extracted from the error, if any
    pub status: Option<u16>,
}

impl FailureRecord {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), message: message.into(), status: None }
    }

    /// Snapshot a classifiable error.
    ///
    /// The status comes from, in order: [`Classify::http_status`], a
    /// [`Classify::numeric_code`] in `100..=599`, then the first standalone three-digit
    /// number in `100..=599` found in the message.
    pub fn from_error<E: Classify + ?Sized>(err: &E) -> Self {
        let message = err.to_string();
        let status = err
            .http_status()
            .or_else(|| err.numeric_code().and_then(as_http_status))
            .or_else(|| scan_status(&message));
        Self { type_name: err.type_name().into_owned(), message, status }
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self::new("TimeoutError", format!("operation timed out after {}ms", timeout.as_millis()))
    }

    pub(crate) fn from_resilience<E: Classify>(err: &ResilienceError<E>) -> Self {
        match err {
            ResilienceError::Inner(inner) => Self::from_error(inner),
            ResilienceError::Timeout { timeout, .. } => Self::timeout(*timeout),
            ResilienceError::CircuitOpen { .. } => Self::new("CircuitOpenError", err.to_string()),
            ResilienceError::RateLimited { .. } => Self::new("RateLimitedError", err.to_string()),
            ResilienceError::Config(config) => Self::new("ConfigError", config.to_string()),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

fn as_http_status(code: i64) -> Option<u16> {
    (100..=599).contains(&code).then_some(code as u16)
}

/// First standalone run of exactly three ASCII digits forming a status in `100..=599`.
fn scan_status(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    (0..bytes.len().saturating_sub(2)).find_map(|i| {
        let digits = &bytes[i..i + 3];
        let bounded = (i == 0 || !is_word(bytes[i - 1]))
            && bytes.get(i + 3).map_or(true, |&b| !is_word(b));
        if !bounded || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let code = digits.iter().fold(0i64, |acc, d| acc * 10 + i64::from(d - b'0'));
        as_http_status(code)
    })
}

/// Which failures are retried. Every non-empty condition must accept the failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConditions {
    /// Retry only these HTTP statuses; failures without a status are not excluded
    pub http_codes: Vec<u16>,
    /// Retry only errors whose type name is listed
    pub error_types: Vec<String>,
    /// Retry only errors whose message contains one of these, case-insensitively
    pub error_messages: Vec<String>,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
}

impl RetryConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http_codes<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Self {
        self.http_codes = codes.into_iter().collect();
        self
    }

    pub fn error_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn error_messages<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_messages = messages.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn should_retry(&self, failure: &FailureRecord) -> bool {
        if !self.http_codes.is_empty() {
            if let Some(status) = failure.status {
                if !self.http_codes.contains(&status) {
                    return false;
                }
            }
        }
        if !self.error_types.is_empty() && !self.error_types.iter().any(|t| *t == failure.type_name)
        {
            return false;
        }
        if !self.error_messages.is_empty() {
            let message = failure.message.to_lowercase();
            if !self.error_messages.iter().any(|m| message.contains(&m.to_lowercase())) {
                return false;
            }
        }
        true
    }
}
