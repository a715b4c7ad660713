use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric codes surfaced by every fallible operation. Callers
/// dispatch on these; the numbers are part of the public contract and never
/// change meaning.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u16)]
pub enum ErrorCode {
    MismatchingValueType = 1001,
    TypeConstraintViolation = 1004,
    InvalidValue = 1005,
    InvalidType = 1006,
    UndefinedType = 1007,
    TypeNotMapped = 1008,
    DecodingBinaryValue = 2001,
    EncodingBinaryValue = 2002,
    SkippingBinaryValue = 2004,
    DecodingBinaryType = 3002,
    EncodingBinaryType = 3003,
    SkippingBinaryType = 3004,
    ReadingFailed = 5001,
    WritingFailed = 5002,
    AlreadyRead = 6001,
    OutOfBounds = 6003,
    AlreadyWritten = 6004,
    MalformedBinary = 6006,
    TypeAlreadyMapped = 6007,
    CyclicDependency = 6008,
    ModulesUndefined = 6009,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", u16::from(*self))
    }
}

/// Structured error value: a code from [`ErrorCode`], a short message,
/// zero or more `(key, value)` details and an optional wrapped source.
#[derive(Debug, ThisError)]
#[error("[{code}] {message}{}", render_details(.details))]
pub struct Error {
    code: ErrorCode,
    message: String,
    details: Vec<(String, String)>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

fn render_details(details: &[(String, String)]) -> String {
    if details.is_empty() {
        return String::new();
    }
    let body: Vec<String> =
        details.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!(" ({})", body.join(", "))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            source: None,
        }
    }

    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[(String, String)] {
        &self.details
    }

    /// Clone of this error for sticky-state replay. The wrapped source is
    /// not cloneable and is dropped; code, message and details survive.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            source: None,
        }
    }

    pub(crate) fn reading(err: std::io::Error) -> Self {
        Self::new(ErrorCode::ReadingFailed, "reading from input failed")
            .with_source(err)
    }

    pub(crate) fn writing(err: std::io::Error) -> Self {
        Self::new(ErrorCode::WritingFailed, "writing to output failed")
            .with_source(err)
    }

    pub(crate) fn reading_frame(err: bincode::Error) -> Self {
        Self::new(ErrorCode::ReadingFailed, "reading fixed frame failed")
            .with_source(err)
    }
}
