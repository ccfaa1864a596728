//! Crate-wide error and fault-code types.

/// Errors surfaced by registration and loop operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The handle does not name a live registration.
    #[error("unknown handle")]
    Unknown,

    /// The file descriptor (or timer) does not exist.
    #[error("file descriptor does not exist")]
    NonExistent,

    /// The operation cannot be carried out in the current state.
    #[error("operation not possible")]
    NotPossible,

    /// The handle space is exhausted.
    #[error("too many handles in use")]
    TooMany,

    /// The collaborator lacks this capability.
    #[error("operation not supported")]
    NotSupported,

    /// Underlying IO error.
    #[error("underlying IO error")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Into::<std::io::Error>::into(err).into()
    }
}

pub type Result<T> = core::result::Result<T, Error>;

bitflags::bitflags! {
    /// Construction-time fault codes. These are recorded rather than
    /// returned so the embedder can decide what a partially constructed
    /// handler is worth; see [`EventHandler::fatal_error_occurred`].
    ///
    /// [`EventHandler::fatal_error_occurred`]: crate::EventHandler::fatal_error_occurred
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InternalCodes: u8 {
        /// The wake-up pipe could not be created.
        const PIPE_ERROR = 1 << 0;
        /// The wake-up pipe could not be registered for polling.
        const FD_ERROR = 1 << 1;
    }
}
