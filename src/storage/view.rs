// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::error::Result;

use super::{Area, IsPersistent, Items};

/// Exposes the keys of an underlying area that begin with `<prefix>.` as if
/// they were the whole area, with the prefix removed.
pub(crate) struct View<A> {
    prefix: String,
    area: A,
}

impl<A: Area> View<A> {
    pub(crate) fn new(prefix: &str, area: A) -> Self {
        Self {
            prefix: format!("{prefix}."),
            area,
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl<A: IsPersistent> IsPersistent for View<A> {
    fn is_persistent(&self) -> bool {
        self.area.is_persistent()
    }
}

#[async_trait]
impl<A: Area> Area for View<A> {
    async fn set(&self, items: Items) -> Result<()> {
        let qualified = items
            .into_iter()
            .map(|(key, value)| (self.qualify(&key), value))
            .collect();
        self.area.set(qualified).await
    }

    async fn get(&self) -> Result<Items> {
        Ok(self
            .area
            .get()
            .await?
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .map(|unqualified| (unqualified.to_owned(), value))
            })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let qualified: Vec<String> = keys.iter().map(|key| self.qualify(key)).collect();
        self.area.delete(&qualified).await
    }
}
