//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::PathBuf;

use ipnetwork::IpNetwork;
use tonic::Status;

use crate::bird::DecodeError;

// Import pipeline errors.
#[derive(Debug)]
pub enum Error {
    // Gateway connection
    InvalidEndpoint(String),
    // RPC failures
    InsertRoute(Status),
    FlushRoutes(Status),
    StreamOpen(Status),
    StreamSend(IpNetwork),
    // Stream lifecycle
    StreamClosed,
    SendCancelled(Option<Status>),
    Cancelled,
    // BIRD feed
    BirdConnect(PathBuf, std::io::Error),
    Feed(DecodeError),
}

// ===== impl Error =====

impl Error {
    // Whether the import was cancelled, either observed directly by the
    // export reader or mid-send by the update forwarder. Cancellation is
    // terminal for the import loop.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::SendCancelled(..))
    }

    // Whether the feed stream was already closed when this error was
    // produced. The supervisor must not close the stream a second time.
    pub fn stream_closed(&self) -> bool {
        matches!(self, Error::StreamClosed | Error::SendCancelled(..))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidEndpoint(endpoint) => {
                write!(f, "invalid gateway endpoint: {}", endpoint)
            }
            Error::InsertRoute(status) => {
                write!(f, "failed to insert static route: {}", status)
            }
            Error::FlushRoutes(status) => {
                write!(f, "failed to flush routes: {}", status)
            }
            Error::StreamOpen(status) => {
                write!(f, "failed to open feed stream: {}", status)
            }
            Error::StreamSend(prefix) => {
                write!(f, "failed to send route update for {}", prefix)
            }
            Error::StreamClosed => {
                write!(f, "feed stream is already closed")
            }
            Error::SendCancelled(close_error) => {
                write!(f, "update send cancelled, feed stream closed")?;
                if let Some(status) = close_error {
                    write!(f, " with error: {}", status)?;
                }
                Ok(())
            }
            Error::Cancelled => {
                write!(f, "import cancelled")
            }
            Error::BirdConnect(path, error) => {
                write!(
                    f,
                    "failed to connect to BIRD socket {}: {}",
                    path.display(),
                    error
                )
            }
            Error::Feed(error) => {
                write!(f, "BIRD feed error: {}", error)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Error {
        Error::Feed(error)
    }
}
