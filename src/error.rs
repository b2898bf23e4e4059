use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Io(std::io::Error),

    /// The resume point of a watch is older than the server keeps
    Expired(String),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "serialization failed: {e}"),
            Self::Kube(e) => write!(fmt, "cluster api error: {e}"),
            Self::Infer(e) => write!(fmt, "unable to infer cluster config: {e}"),
            Self::Io(e) => write!(fmt, "io error: {e}"),
            Self::Expired(msg) => write!(fmt, "watch resource version expired: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether a watch must restart from a fresh listing
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }
}
