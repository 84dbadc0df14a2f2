// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use async_trait::async_trait;
use clap::Parser;
use tokio::fs;

use crate::{api, error::Result};

/// Add a PEM-encoded private key to the key store. The key is not loaded.
#[derive(Debug, Parser)]
pub(crate) struct Command {
    /// A name to show for the key.
    #[clap(short, long)]
    name: String,

    /// The private key file. Encrypted keys are stored as they are and only
    /// decrypted when loaded.
    #[clap(value_hint = clap::ValueHint::FilePath)]
    path: PathBuf,
}

#[async_trait]
impl super::Command for Command {
    async fn execute(self, client: &mut api::Client) -> Result<()> {
        let pem = fs::read_to_string(&self.path).await?;
        let id = client.add(self.name, pem).await?;
        println!("{id}");
        Ok(())
    }
}
