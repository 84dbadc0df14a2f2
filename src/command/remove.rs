// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use clap::Parser;

use crate::{api, error::Result, keys::Id};

/// Forget a key. A loaded copy stays in the agent until it is unloaded.
#[derive(Debug, Parser)]
pub(crate) struct Command {
    #[clap()]
    id: Id,
}

#[async_trait]
impl super::Command for Command {
    async fn execute(self, client: &mut api::Client) -> Result<()> {
        client.remove(self.id).await
    }
}
