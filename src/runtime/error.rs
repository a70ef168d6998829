//! Error types surfaced by the bridge.

use crate::runtime::js_value::{JsValue, ValueKind};
use crate::runtime::sys::{Env, RawValue, Status, StatusError};
use std::any::Any;
use std::fmt;

/// A dynamic value could not be converted to or from a host value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ConversionError {
    kind: Option<ValueKind>,
    target: Option<String>,
    message: String,
    partial: Option<RawValue>,
}

impl ConversionError {
    /// The value's tag cannot populate the requested host target.
    pub fn mismatch(kind: ValueKind, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            message: format!("cannot set {} to {}", kind, target),
            kind: Some(kind),
            target: Some(target),
            partial: None,
        }
    }

    pub fn custom(message: impl fmt::Display) -> Self {
        Self {
            kind: None,
            target: None,
            message: message.to_string(),
            partial: None,
        }
    }

    pub(crate) fn with_partial(mut self, raw: RawValue) -> Self {
        self.partial = Some(raw);
        self
    }

    /// Tag of the value being converted, when known.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The array built before an element failed to serialize. Elements from
    /// the failing one onward are `undefined`.
    pub fn partial(&self) -> Option<RawValue> {
        self.partial
    }
}

/// A wrapped host function was called with the wrong number of arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub struct ArityError {
    pub expected: usize,
    pub received: usize,
    pub variadic: bool,
}

impl fmt::Display for ArityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variadic {
            write!(
                f,
                "require minimum {} arguments, called with {}",
                self.expected, self.received
            )
        } else {
            write!(
                f,
                "require {} arguments, called with {}",
                self.expected, self.received
            )
        }
    }
}

/// Every failure the bridge reports to host code.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Arity(#[from] ArityError),
    /// A panic recovered at a fault boundary.
    #[error("panic recovered: {0}")]
    Fault(String),
    /// A script exception observed by host code.
    #[error("{0}")]
    Thrown(String),
    /// Engine thread or channel failure.
    #[error("{0}")]
    Runtime(String),
}

impl BridgeError {
    pub fn runtime(message: impl Into<String>) -> Self {
        BridgeError::Runtime(message.into())
    }

    /// Build a `Fault` from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        BridgeError::Fault(panic_message(payload.as_ref()))
    }

    /// The ABI status behind this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            BridgeError::Status(err) => Some(err.status()),
            _ => None,
        }
    }

    /// Attach a partially built array to a conversion failure. Other errors
    /// pass through unchanged.
    pub(crate) fn with_partial(self, raw: RawValue) -> Self {
        match self {
            BridgeError::Conversion(err) => BridgeError::Conversion(err.with_partial(raw)),
            other => other,
        }
    }

    /// The partial result of a failed array conversion, if `env` still holds it.
    pub fn partial(&self, env: &Env) -> Option<JsValue> {
        match self {
            BridgeError::Conversion(err) => JsValue::new(env, err.partial()?).ok(),
            _ => None,
        }
    }

    /// `code` property given to the script error this becomes when thrown.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            BridgeError::Arity(_) => Some("ERR_INVALID_ARG_COUNT"),
            BridgeError::Conversion(_) => Some("ERR_INVALID_ARG_TYPE"),
            BridgeError::Fault(_) => Some("ERR_HOST_PANIC"),
            BridgeError::Status(_) => Some("ERR_NAPI_STATUS"),
            BridgeError::Thrown(_) | BridgeError::Runtime(_) => None,
        }
    }
}

impl From<Status> for BridgeError {
    fn from(status: Status) -> Self {
        BridgeError::Status(StatusError(status))
    }
}

impl From<String> for BridgeError {
    fn from(message: String) -> Self {
        BridgeError::Runtime(message)
    }
}

impl From<&str> for BridgeError {
    fn from(message: &str) -> Self {
        BridgeError::Runtime(message.to_string())
    }
}

impl serde::ser::Error for BridgeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        BridgeError::Conversion(ConversionError::custom(msg))
    }
}

impl serde::de::Error for BridgeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        BridgeError::Conversion(ConversionError::custom(msg))
    }
}

/// Render a panic payload the way the standard panic hook does.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(err) = payload.downcast_ref::<BridgeError>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
