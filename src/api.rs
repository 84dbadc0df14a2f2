// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Key management requests, as exchanged between the command line client and
//! a running agent.

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use log::warn;
use secrecy::{DebugSecret, ExposeSecret, Secret, SecretString, SerializableSecret, Zeroize};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use url::Url;

use crate::{
    error::{self, Result},
    keys::{ConfiguredKeyInfo, Id, LoadedKey, Manager},
    message,
};

pub(crate) const MANAGE_PATH: &str = "/manage";

#[derive(Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub(crate) struct Passphrase(String);

impl Zeroize for Passphrase {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl DebugSecret for Passphrase {}

impl SerializableSecret for Passphrase {}

impl Passphrase {
    fn from_secret(value: &SecretString) -> Secret<Self> {
        Secret::new(Self(value.expose_secret().clone()))
    }

    fn to_secret(value: &Secret<Self>) -> SecretString {
        SecretString::new(value.expose_secret().0.clone())
    }
}

#[derive(Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum Request {
    Configured,
    Loaded,
    Add {
        name: String,
        #[serde(rename = "pemPrivateKey")]
        pem_private_key: String,
    },
    Remove {
        id: Id,
    },
    Load {
        id: Id,
        passphrase: Secret<Passphrase>,
    },
    Unload {
        id: Id,
    },
}

// Key material never reaches the logs.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => f.write_str("Configured"),
            Self::Loaded => f.write_str("Loaded"),
            Self::Add { name, .. } => f
                .debug_struct("Add")
                .field("name", name)
                .field("pem_private_key", &"[REDACTED]")
                .finish(),
            Self::Remove { id } => f.debug_struct("Remove").field("id", id).finish(),
            Self::Load { id, .. } => f
                .debug_struct("Load")
                .field("id", id)
                .field("passphrase", &"[REDACTED]")
                .finish(),
            Self::Unload { id } => f.debug_struct("Unload").field("id", id).finish(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum FailureKind {
    InvalidName,
    KeyNotFound,
    IncorrectPassphrase,
    Other,
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum Response {
    Configured { keys: Vec<ConfiguredKeyInfo> },
    Loaded { keys: Vec<LoadedKey> },
    Added { id: Id },
    Done,
    Failure { kind: FailureKind, message: String },
}

impl From<error::Error> for Response {
    fn from(value: error::Error) -> Self {
        // LINT: Everything else is reported with its message only.
        #[allow(clippy::wildcard_enum_match_arm)]
        let kind = match value {
            error::Error::Key(error::Key::InvalidName) => FailureKind::InvalidName,
            error::Error::Key(error::Key::NotFound(_)) => FailureKind::KeyNotFound,
            ref e if e.is_incorrect_passphrase() => FailureKind::IncorrectPassphrase,
            _ => FailureKind::Other,
        };

        Self::Failure {
            kind,
            message: value.to_string(),
        }
    }
}

impl Response {
    /// Turns a failure reported by the agent back into the matching error.
    fn into_result(self) -> Result<Self> {
        match self {
            Self::Failure { kind, message } => Err(match kind {
                FailureKind::InvalidName => error::Key::InvalidName.into(),
                FailureKind::IncorrectPassphrase => {
                    error::Key::ParseFailed(error::Parse::IncorrectPassphrase).into()
                }
                FailureKind::KeyNotFound => error::Key::NotFound(message).into(),
                FailureKind::Other => error::Api::ServerError(message).into(),
            }),
            other => Ok(other),
        }
    }
}

/// Carries out `req` and describes the outcome. Failures become
/// [`Response::Failure`] rather than errors.
pub(crate) async fn dispatch(manager: &Manager, req: Request) -> Response {
    let result = match req {
        Request::Configured => manager
            .configured()
            .await
            .map(|keys| Response::Configured { keys }),
        Request::Loaded => manager.loaded().await.map(|keys| Response::Loaded { keys }),
        Request::Add {
            name,
            pem_private_key,
        } => manager
            .add(&name, &pem_private_key)
            .await
            .map(|id| Response::Added { id }),
        Request::Remove { id } => manager.remove(&id).await.map(|()| Response::Done),
        Request::Load { id, passphrase } => manager
            .load(&id, Passphrase::to_secret(&passphrase))
            .await
            .map(|()| Response::Done),
        Request::Unload { id } => manager.unload(&id).await.map(|()| Response::Done),
    };

    result.unwrap_or_else(|e| {
        warn!("Request failed: {}", e);
        e.into()
    })
}

pub(crate) struct Client {
    stream: message::WebSocketStream<MaybeTlsStream<TcpStream>, Response, Request>,
}

impl Client {
    pub(crate) async fn connect(url: &Url) -> Result<Self> {
        let url = url.join(MANAGE_PATH).map_err(|e| error::Api::ServerError(e.to_string()))?;
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Self {
            stream: stream.into(),
        })
    }

    async fn call(&mut self, req: Request) -> Result<Response> {
        self.stream.send(req).await?;
        self.stream
            .next()
            .await
            .ok_or(error::Api::StreamEnded)??
            .into_result()
    }

    pub(crate) async fn configured(&mut self) -> Result<Vec<ConfiguredKeyInfo>> {
        match self.call(Request::Configured).await? {
            Response::Configured { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) async fn loaded(&mut self) -> Result<Vec<LoadedKey>> {
        match self.call(Request::Loaded).await? {
            Response::Loaded { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) async fn add(&mut self, name: String, pem_private_key: String) -> Result<Id> {
        match self
            .call(Request::Add {
                name,
                pem_private_key,
            })
            .await?
        {
            Response::Added { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) async fn remove(&mut self, id: Id) -> Result<()> {
        self.expect_done(Request::Remove { id }).await
    }

    pub(crate) async fn load(&mut self, id: Id, passphrase: SecretString) -> Result<()> {
        self.expect_done(Request::Load {
            id,
            passphrase: Passphrase::from_secret(&passphrase),
        })
        .await
    }

    pub(crate) async fn unload(&mut self, id: Id) -> Result<()> {
        self.expect_done(Request::Unload { id }).await
    }

    async fn expect_done(&mut self, req: Request) -> Result<()> {
        match self.call(req).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) async fn close(mut self) -> Result<()> {
        self.stream.close().await
    }
}

fn unexpected(resp: &Response) -> error::Error {
    error::Api::UnhandledResponse(format!("{resp:?}")).into()
}
