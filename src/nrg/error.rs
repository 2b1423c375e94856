//! Reader error taxonomy.
//!
//! Errors carry a specific code (the enum variant) and an orthogonal cause
//! class, so callers can react to the class without matching every code.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("feature not implemented")]
    NotImplemented,
    #[error("no events were added")]
    NoEventsAdded,
    #[error("no such event exists")]
    NoSuchEvent,
    #[error("no CPU sockets were found")]
    NoSockets,
    #[error("no GPU devices were found")]
    NoDevices,
    #[error("more CPU sockets found than maximum supported")]
    TooManySockets,
    #[error("more GPU devices found than maximum supported")]
    TooManyDevices,
    #[error("invalid RAPL domain name - {0}")]
    InvalidDomainName(String),
    #[error("invalid format version in CPU counters file")]
    FileFormatVersion,
    #[error("GPU does not support energy readings")]
    EnergyReadingsNotSupported,
    #[error("GPU does not support power readings")]
    PowerReadingsNotSupported,
    #[error("GPU does not support energy or power readings")]
    ReadingsNotSupported,
    #[error("counter readings are not valid")]
    ReadingsNotValid,
    #[error("invalid CPU socket mask (no sockets set)")]
    InvalidSocketMask,
    #[error("invalid GPU device mask (no devices set)")]
    InvalidDeviceMask,
    #[error("invalid sensor location mask (no sensors set)")]
    InvalidLocationMask,
    #[error("GPU library error: {0}")]
    GpuLib(#[from] nvml_wrapper::error::NvmlError),
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn system(context: impl Into<String>, source: io::Error) -> Self {
        Error::System {
            context: context.into(),
            source,
        }
    }

    pub fn cause(&self) -> ErrorCause {
        match self {
            Error::NoEventsAdded
            | Error::NoSockets
            | Error::NoDevices
            | Error::TooManySockets
            | Error::TooManyDevices
            | Error::InvalidDomainName(_)
            | Error::FileFormatVersion => ErrorCause::SetupError,
            Error::EnergyReadingsNotSupported
            | Error::PowerReadingsNotSupported
            | Error::ReadingsNotSupported => ErrorCause::ReadingsSupportError,
            Error::NoSuchEvent => ErrorCause::QueryError,
            Error::ReadingsNotValid => ErrorCause::ReadError,
            Error::InvalidSocketMask | Error::InvalidDeviceMask | Error::InvalidLocationMask => {
                ErrorCause::InvalidArgument
            }
            Error::GpuLib(_) => ErrorCause::GpuLibError,
            Error::System { .. } => ErrorCause::SystemError,
            Error::NotImplemented => ErrorCause::Other,
        }
    }
}

/// Broad classification of reader errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCause {
    SetupError,
    ReadingsSupportError,
    QueryError,
    ReadError,
    InvalidArgument,
    GpuLibError,
    SystemError,
    Other,
}

impl ErrorCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCause::SetupError => "error during reader setup",
            ErrorCause::ReadingsSupportError => "error querying GPU energy/power support",
            ErrorCause::QueryError => "error querying value",
            ErrorCause::ReadError => "error reading counters",
            ErrorCause::InvalidArgument => "invalid argument",
            ErrorCause::GpuLibError => "GPU library error",
            ErrorCause::SystemError => "system error",
            ErrorCause::Other => "other error",
        }
    }
}
