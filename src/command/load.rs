// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use async_trait::async_trait;
use clap::Parser;
use log::warn;
use secrecy::SecretString;

use crate::{
    api,
    error::{self, Result},
    keys::Id,
    password::{self, Prompt},
};

/// Decrypt a configured key and add it to the agent.
#[derive(Debug, Parser)]
pub(crate) struct Command {
    /// The path to the Pinentry program to use when asking for the key's
    /// passphrase.
    #[arg(long, value_hint = clap::ValueHint::ExecutablePath)]
    pinentry_program: Option<PathBuf>,

    #[clap()]
    id: Id,
}

#[async_trait]
impl super::Command for Command {
    async fn execute(self, client: &mut api::Client) -> Result<()> {
        let key = client
            .configured()
            .await?
            .into_iter()
            .find(|key| key.id == self.id)
            .ok_or_else(|| error::Key::NotFound(self.id.to_string()))?;

        if !key.encrypted {
            return client.load(self.id, SecretString::new(String::new())).await;
        }

        let prompt: Vec<Box<dyn Prompt>> = vec![
            Box::new(self.pinentry_program.map_or_else(
                password::PinentryPrompt::new,
                password::PinentryPrompt::new_with_executable,
            )),
            Box::new(password::RpasswordPrompt),
        ];

        let mut req = password::RequestBuilder::new(&key.name);
        loop {
            let passphrase = prompt
                .prompt(req.into_request())
                .await?
                .ok_or(error::Password::NoPrompt)?;

            match client.load(self.id.clone(), passphrase).await {
                Err(e) if e.is_incorrect_passphrase() => {
                    warn!("The passphrase was not accepted, so you need to try again");
                    req = password::RequestBuilder::new(&key.name).with_error("Incorrect passphrase.");
                }
                r => return r,
            }
        }
    }
}
