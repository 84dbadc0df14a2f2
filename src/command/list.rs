// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use clap::Parser;
use tabled::{settings::Style, Table};

use crate::{api, error::Result};

/// List the keys the agent knows about.
#[derive(Debug, Parser)]
pub(crate) struct Command {}

#[async_trait]
impl super::Command for Command {
    async fn execute(self, client: &mut api::Client) -> Result<()> {
        let keys = client.configured().await?;
        if !keys.is_empty() {
            println!("{}", Table::new(keys).with(Style::rounded()));
        }
        Ok(())
    }
}
