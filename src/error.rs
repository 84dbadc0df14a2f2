// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{io, result};

use thiserror::Error;
use tokio::sync::mpsc;

pub(crate) type Result<T, E = Error> = result::Result<T, E>;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    Websocket(tokio_tungstenite::tungstenite::Error),
    #[error("JSON format error: {0}")]
    Json(serde_json::Error),
    #[error("agent transport error: {0}")]
    Protocol(#[from] Protocol),
    #[error("storage error: {0}")]
    Storage(#[from] Storage),
    #[error("key error: {0}")]
    Key(#[from] Key),
    #[error("agent keyring error: {0}")]
    Agent(#[from] Agent),
    #[error("API error: {0}")]
    Api(#[from] Api),
    #[error("password retrieval error: {0}")]
    Password(#[from] Password),
    #[error("internal communication error: {0}")]
    Internal(#[from] Internal),
    #[error("command execution failed")]
    Command,
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error means the passphrase supplied for a key was wrong,
    /// so that asking again is reasonable.
    pub(crate) const fn is_incorrect_passphrase(&self) -> bool {
        matches!(*self, Self::Key(Key::ParseFailed(Parse::IncorrectPassphrase)))
    }
}

impl From<pinentry::Error> for Error {
    fn from(value: pinentry::Error) -> Self {
        // LINT: Deliberate fall-through that should catch future cases added to
        // the enum.
        #[allow(
            clippy::wildcard_enum_match_arm,
            clippy::match_wildcard_for_single_variants
        )]
        match value {
            pinentry::Error::Cancelled | pinentry::Error::Timeout => Self::Cancelled,
            pinentry::Error::Io(e) => Self::Io(e),
            _ => Self::Password(Password::Pinentry(value)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        // LINT: Deliberate fall-through that should catch future cases added to
        // the enum.
        #[allow(clippy::wildcard_enum_match_arm)]
        match value.classify() {
            serde_json::error::Category::Io => Self::Io(value.into()),
            _ => Self::Json(value),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Io(value.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        // LINT: Deliberate fall-through that should catch future cases added to
        // the enum.
        #[allow(clippy::wildcard_enum_match_arm)]
        match value {
            tokio_tungstenite::tungstenite::Error::Io(e) => Self::Io(e),
            _ => Self::Websocket(value),
        }
    }
}

#[derive(Error, Debug)]
pub(crate) enum Protocol {
    #[error("malformed message frame: {0}")]
    Decode(String),
    #[error("pipe transfer failed: {0}")]
    Pipe(io::Error),
    #[error("connection is already closed")]
    Disconnected,
}

#[derive(Error, Debug)]
pub(crate) enum Storage {
    #[error("a maximum item size of {0} bytes leaves no room for chunk data")]
    Capacity(usize),
    #[error("item {key:?} needs {size} bytes, but the store allows at most {quota} bytes per item")]
    Quota {
        key: String,
        size: usize,
        quota: usize,
    },
    #[error("value {key:?} references chunk {chunk:?}, which is missing")]
    MissingChunk { key: String, chunk: String },
    #[error("chunk {0:?} does not hold text data")]
    MalformedChunk(String),
}

#[derive(Error, Debug)]
pub(crate) enum Key {
    #[error("name must not be empty")]
    InvalidName,
    #[error("no configured key has ID {0:?}")]
    NotFound(String),
    #[error("failed to decode private key: {0}")]
    DecodeFailed(String),
    #[error("failed to parse private key: {0}")]
    ParseFailed(#[from] Parse),
    #[error("failed to add key to agent: {0}")]
    AgentLoadFailed(Box<Error>),
    #[error("failed to remove key from agent: {0}")]
    AgentUnloadFailed(Box<Error>),
    #[error("failed to remove key from session storage: {0}")]
    StorageUnloadFailed(Box<Error>),
}

#[derive(Error, Debug)]
pub(crate) enum Parse {
    #[error("incorrect passphrase")]
    IncorrectPassphrase,
    #[error("{0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub(crate) enum Agent {
    #[error("no key with ID {0:?} is loaded")]
    NotLoaded(String),
    #[error("key is not present in the keyring")]
    KeyNotFound,
    #[error("key could not be encoded: {0}")]
    Encoding(ssh_key::Error),
    #[error("signing failed: {0}")]
    Signature(signature::Error),
}

#[derive(Error, Debug)]
pub(crate) enum Api {
    #[error("server stream terminated during processing")]
    StreamEnded,
    #[error("server sent a response that we did not expect to receive: {0}")]
    UnhandledResponse(String),
    #[error("server error: {0}")]
    ServerError(String),
}

#[derive(Error, Debug)]
pub(crate) enum Password {
    #[error("no password prompt available")]
    NoPrompt,
    #[error("Pinentry implementation error: {0}")]
    Pinentry(pinentry::Error),
}

#[derive(Error, Debug)]
pub(crate) enum Internal {
    #[error("channel is closed")]
    ChannelClosed,
    #[error("lock is poisoned")]
    Poisoned,
}

impl<T> From<mpsc::error::SendError<T>> for Internal {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

