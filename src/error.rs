//! Error types shared by the codec, the subscription registry and the store adapter.

/// Errors surfaced by this crate.
///
/// Data that is merely not yet visible in the local store is never an error; it is
/// reported to listeners as a "no endpoints" state instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed IP address or port was handed to the address codec.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A subscription request was structurally invalid.
    #[error("invalid subscription: {0}")]
    Subscription(String),

    /// The store's writer went away before the initial listing completed.
    #[error("cluster store closed before initial sync completed")]
    StoreClosed,

    /// The Kubernetes client could not be used.
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Subscription(_) => Self::invalid_argument(error.to_string()),
            Error::InvalidAddress(_) => Self::internal(error.to_string()),
            Error::StoreClosed | Error::Kube(_) => Self::unavailable(error.to_string()),
        }
    }
}
