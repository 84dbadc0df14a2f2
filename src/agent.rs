// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Runs the SSH agent protocol over [`AgentStream`]s.

use std::{io, sync::Arc};

use log::{debug, error};
use ssh_agent_lib::{
    agent::{listen, Agent, ListeningSocket, Session},
    error::AgentError,
    proto::{Identity, SignRequest},
};
use ssh_key::Signature;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{agentport::AgentStream, keys::Keyring};

fn agent_error(e: impl ToString) -> AgentError {
    AgentError::other(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Answers agent requests from the shared keyring. Cloned for every
/// connection.
#[derive(Clone, Debug)]
pub(crate) struct KeyringSession {
    keyring: Arc<Keyring>,
}

#[ssh_agent_lib::async_trait]
impl Session for KeyringSession {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let identities: Vec<Identity> = self
            .keyring
            .identities()
            .await
            .into_iter()
            .map(|(pubkey, comment)| Identity { pubkey, comment })
            .collect();
        debug!("Offering {} identities", identities.len());
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        self.keyring
            .sign(&request.pubkey, &request.data)
            .await
            .map_err(agent_error)
    }
}

impl Agent<PortListener> for KeyringSession {
    fn new_session(&mut self, _: &AgentStream) -> impl Session {
        self.clone()
    }
}

/// Hands streams of newly attached ports to the agent as if they were
/// accepted socket connections.
#[derive(Debug)]
pub(crate) struct PortListener {
    streams: mpsc::Receiver<AgentStream>,
}

#[ssh_agent_lib::async_trait]
impl ListeningSocket for PortListener {
    type Stream = AgentStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        self.streams
            .recv()
            .await
            .ok_or_else(|| io::ErrorKind::BrokenPipe.into())
    }
}

/// Starts the agent. Every stream sent on the returned channel is served
/// until its port disconnects.
pub(crate) fn spawn(keyring: Arc<Keyring>) -> (mpsc::Sender<AgentStream>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        if let Err(e) = listen(PortListener { streams: rx }, KeyringSession { keyring }).await {
            error!("SSH agent stopped: {}", e);
        }
    });
    (tx, handle)
}
