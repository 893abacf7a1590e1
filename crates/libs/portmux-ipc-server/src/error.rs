/// Errors produced while building or parsing channel names.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum NamingError {
    #[error("malformed channel name: {name}")]
    Malformed { name: String },

    #[error("namespace must be non-empty")]
    EmptyNamespace,

    #[error("invalid discriminator: {discriminator}")]
    InvalidDiscriminator { discriminator: String },
}

/// Errors surfaced by the session server to the embedding process.
///
/// Request-scoped failures never appear here; they travel to the client as
/// error envelopes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("registry for namespace {namespace} already initialized with different parameters")]
    InitMismatch { namespace: String },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn init_mismatch(namespace: impl Into<String>) -> Self {
        Self::InitMismatch {
            namespace: namespace.into(),
        }
    }
}
