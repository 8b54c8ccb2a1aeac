use http::StatusCode;

use delay_store::StoreError;

/// Errors produced by the Gatekeeper middleware on the request path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The governor's next allowed time is further away than `max_delay`.
    ///
    /// When the `axum` feature is enabled, this converts to the location's
    /// configured status code (`503 Service Unavailable` by default).
    #[error("Request rejected by admission control")]
    Rejected {
        /// Status code configured for the location.
        status: StatusCode,
    },

    /// The host tore the connection down while the request was delayed.
    #[error("Client went away while the request was delayed")]
    Disconnected,

    /// The identifier or log-info expression could not be evaluated.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Failed to evaluate {what} expression: {reason}")]
    Expression { what: &'static str, reason: String },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl GateError {
    /// Status code the host should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Rejected { status } => *status,
            Self::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
            Self::Expression { .. } | Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let msg = match self {
            // Do not leak internals to clients.
            Self::Expression { .. } | Self::Inner(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };
        (status, msg).into_response()
    }
}

/// Fatal problems found while compiling the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid governor address '{address}': {reason}")]
    Address { address: String, reason: &'static str },

    #[error("Unknown variable '{0}' in expression")]
    UnknownVariable(String),

    #[error("Invalid reject status {0}; expected 400..=599")]
    Status(u16),

    #[error("Invalid domain '{0}'")]
    Domain(String),

    #[error("Invalid size '{0}'")]
    Size(String),

    #[error("No location named '{0}'")]
    UnknownLocation(String),

    #[error("Failed to read configuration: {0}")]
    Load(String),
}

/// Errors that abort [`Gatekeeper`](crate::Gatekeeper) startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: crate::TransportError,
    },
}
