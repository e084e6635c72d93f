/// Store error with retry classification.
///
/// `retryable == true` is the "store unavailable" condition: the write did not land and
/// the same call may succeed later. Anything else (a rejected append, corrupt data) is
/// permanent and retrying will not help.
///
/// ```rust
/// use duractor::providers::ProviderError;
///
/// let busy = ProviderError::unavailable("append", "disk is busy");
/// assert!(busy.is_retryable());
///
/// let rejected = ProviderError::permanent("append", "event_id 7 does not follow 3");
/// assert!(!rejected.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed (`append`, `read`, `write_snapshot`, ...)
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Transient failure; the operation had no effect and may be retried.
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not go away on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// I/O errors are treated as transient, except for malformed data.
    pub fn from_io(operation: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => Self::permanent(operation, err.to_string()),
            _ => Self::unavailable(operation, err.to_string()),
        }
    }

    pub fn from_serde(operation: &str, err: serde_json::Error) -> Self {
        Self::permanent(operation, format!("serialization: {err}"))
    }

    /// Convert to the recorded form used in histories and replies.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.retryable {
            write!(f, "store unavailable: {}: {}", self.operation, self.message)
        } else {
            write!(f, "{}: {}", self.operation, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}
