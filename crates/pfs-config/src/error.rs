use thiserror::Error;

/// Error kinds shared across the metadata service, file service, and client
/// runtime. The `Display` text is what RPC handlers put in a response's
/// `error` field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),
}

impl PfsError {
    /// Encode this error as the flat string carried on an RPC response's
    /// `error` field.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Decode a wire-format error string produced by [`PfsError::to_wire`].
    /// Unrecognized prefixes are folded into `TransportFailed` since that's
    /// the only kind the client treats as session-terminal.
    pub fn from_wire(s: &str) -> Self {
        let (prefix, rest) = s.split_once(": ").unwrap_or((s, ""));
        match prefix {
            "not found" => PfsError::NotFound(rest.to_string()),
            "already exists" => PfsError::AlreadyExists(rest.to_string()),
            "invalid argument" => PfsError::InvalidArgument(rest.to_string()),
            "busy" => PfsError::Busy(rest.to_string()),
            _ => PfsError::TransportFailed(s.to_string()),
        }
    }
}

impl From<tonic::Status> for PfsError {
    fn from(status: tonic::Status) -> Self {
        PfsError::TransportFailed(status.message().to_string())
    }
}

impl From<tonic::transport::Error> for PfsError {
    fn from(err: tonic::transport::Error) -> Self {
        PfsError::TransportFailed(err.to_string())
    }
}
