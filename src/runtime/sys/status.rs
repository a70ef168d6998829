//! Status codes returned by every embedding ABI call.

use std::fmt;

/// Integral status code indicating the success or failure of an ABI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    BigintExpected,
    DateExpected,
    ArraybufferExpected,
    DetachableArraybufferExpected,
    WouldDeadlock,
}

impl Status {
    /// Convert the status into a `Result`, mapping every non-OK code to [`StatusError`].
    pub fn to_result(self) -> Result<(), StatusError> {
        match self {
            Status::Ok => Ok(()),
            other => Err(StatusError(other)),
        }
    }

    /// The C-level name of the status code.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "napi_ok",
            Status::InvalidArg => "napi_invalid_arg",
            Status::ObjectExpected => "napi_object_expected",
            Status::StringExpected => "napi_string_expected",
            Status::NameExpected => "napi_name_expected",
            Status::FunctionExpected => "napi_function_expected",
            Status::NumberExpected => "napi_number_expected",
            Status::BooleanExpected => "napi_boolean_expected",
            Status::ArrayExpected => "napi_array_expected",
            Status::GenericFailure => "napi_generic_failure",
            Status::PendingException => "napi_pending_exception",
            Status::Cancelled => "napi_cancelled",
            Status::EscapeCalledTwice => "napi_escape_called_twice",
            Status::HandleScopeMismatch => "napi_handle_scope_mismatch",
            Status::CallbackScopeMismatch => "napi_callback_scope_mismatch",
            Status::QueueFull => "napi_queue_full",
            Status::Closing => "napi_closing",
            Status::BigintExpected => "napi_bigint_expected",
            Status::DateExpected => "napi_date_expected",
            Status::ArraybufferExpected => "napi_arraybuffer_expected",
            Status::DetachableArraybufferExpected => "napi_detachable_arraybuffer_expected",
            Status::WouldDeadlock => "napi_would_deadlock",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A non-OK [`Status`] surfaced as an error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("napi_status error: {0}")]
pub struct StatusError(pub Status);

impl StatusError {
    pub fn status(&self) -> Status {
        self.0
    }
}

/// Result of a raw ABI call.
pub type SysResult<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_status_is_not_an_error() {
        assert!(Status::Ok.to_result().is_ok());
        assert_eq!(
            Status::QueueFull.to_result(),
            Err(StatusError(Status::QueueFull))
        );
    }

    #[test]
    fn test_status_error_message() {
        let err = StatusError(Status::Closing);
        assert_eq!(err.to_string(), "napi_status error: napi_closing");
        assert_eq!(err.status(), Status::Closing);
    }
}
