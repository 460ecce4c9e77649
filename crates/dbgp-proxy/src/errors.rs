//! Typed error enums for each module boundary, composed with `#[from]` so that
//! `anyhow::Result` at the handler/main level can `.context(..)` them freely.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("connection closed before a terminator was read")]
    Incomplete,

    #[error("response length prefix was not valid ASCII decimal: {0:?}")]
    BadLength(String),

    #[error("response payload was not followed by a terminating NUL byte")]
    MissingTrailer,

    #[error("io error while framing a message")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no argument for -{0}")]
    MissingValue(char),

    #[error("unknown argument -{flag} (with value `{value}`)")]
    UnknownArgument { flag: char, value: String },

    #[error("no IDE key was provided")]
    MissingIdeKey,

    #[error("no username was provided")]
    MissingUserId,

    #[error("could not parse numeric value for -{flag}: `{value}`")]
    InvalidNumber { flag: char, value: String },

    #[error("unrecognised command verb `{0}`")]
    UnknownVerb(String),

    #[error("command line was empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("failed to parse handshake document: {0}")]
    Parse(String),

    #[error("failed to serialise reply document: {0}")]
    Serialize(String),

    #[error("handshake document carried neither an idekey nor an xdebug:userid")]
    MissingRoutingKey,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("key `{0}` is already registered")]
    Duplicate(String),

    #[error("key `{0}` is not registered")]
    Absent(String),

    #[error("key `{0}` is already claimed by another session")]
    AlreadyClaimed(String),

    #[error("key `{0}` is not currently claimed")]
    NotClaimed(String),
}

#[derive(Debug, Error)]
pub enum SpliceError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no IDE was registered for key `{0}`")]
    NoSuchIde(String),

    #[error("failed to dial IDE endpoint {host}:{port}")]
    Dial {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("session was evicted by the registry")]
    Evicted,

    #[error("session terminator `{0}` observed")]
    Terminated(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
