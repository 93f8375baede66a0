use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes cleanly for a UI bridge so the frontend gets structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The log service answered 502/503/504.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The request never produced a response (connect, timeout, CORS-level failure).
    #[error("Network offline: {0}")]
    NetworkOffline(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// True when the transport itself looks down rather than one run misbehaving.
    /// Governs which retry policy a poller applies; never affects correctness.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, AppError::ServiceUnavailable(_) | AppError::NetworkOffline(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::NetworkOffline(_) => "network_offline",
            AppError::NotFound(_) => "not_found",
            AppError::Http { .. } => "http",
            AppError::Transport(_) => "transport",
            AppError::QuotaExceeded(_) => "quota_exceeded",
            AppError::Storage(_) => "storage",
            AppError::Validation(_) => "validation",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Serialized as `{ error: "...", kind: "..." }` for frontend consumption.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_unavailable_classification() {
        assert!(AppError::ServiceUnavailable("503".into()).is_service_unavailable());
        assert!(AppError::NetworkOffline("connect refused".into()).is_service_unavailable());
        assert!(!AppError::NotFound("run r1".into()).is_service_unavailable());
        assert!(!AppError::Http { status: 500, message: "boom".into() }.is_service_unavailable());
    }

    #[test]
    fn test_serializes_with_kind() {
        let err = AppError::NotFound("run r1".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["error"], "Not found: run r1");
    }
}
