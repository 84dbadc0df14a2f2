// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{api, error::Result};

pub(crate) mod add;
pub(crate) mod list;
pub(crate) mod load;
pub(crate) mod loaded;
pub(crate) mod remove;
pub(crate) mod unload;

#[async_trait]
pub(crate) trait Command {
    async fn execute(self, client: &mut api::Client) -> Result<()>;
}
