use libc::pid_t;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy. Every public operation of the engine returns
/// the first of these it runs into; cleanup paths still run but their
/// secondary failures are suppressed once a primary error is set.
#[derive(Debug, Error)]
pub enum Error {
    /// The tracee is no longer alive. Resume/step requests return this and
    /// leave all engine state untouched.
    #[error("process {pid} has exited")]
    ProcessExited { pid: pid_t },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The dynamic linker has not populated DT_DEBUG yet. Transient; callers
    /// retry on the next eligible stop.
    #[error("rendezvous address not found")]
    RendezvousAddressNotFound,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: nix::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dwarf error: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("elf error: {0}")]
    Elf(String),
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound(msg.into())
    }

    pub fn decode<S: Into<String>>(msg: S) -> Error {
        Error::Decode(msg.into())
    }

    pub fn os<S: Into<String>>(context: S, source: nix::Error) -> Error {
        Error::Os {
            context: context.into(),
            source,
        }
    }

    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Error {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the transient rendezvous probe failure that the process
    /// engine swallows until the linker has filled in DT_DEBUG.
    pub fn is_transient_rendezvous(&self) -> bool {
        matches!(self, Error::RendezvousAddressNotFound)
    }
}

impl From<goblin::error::Error> for Error {
    fn from(e: goblin::error::Error) -> Error {
        Error::Elf(e.to_string())
    }
}
