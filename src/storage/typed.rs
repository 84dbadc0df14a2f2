// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::marker::PhantomData;

use log::warn;
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::Result, rng};

use super::{Area, IsPersistent, Items, View};

/// A collection of records of one type, stored under random identifiers in a
/// prefixed view of an area.
///
/// Records that no longer deserialize are skipped with a warning rather than
/// failing the whole read, so a single corrupt entry cannot hide the rest.
pub(crate) struct KeyStore<V> {
    view: View<Box<dyn Area>>,
    records: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> KeyStore<V> {
    pub(crate) fn new(prefix: &str, area: Box<dyn Area>) -> Self {
        Self {
            view: View::new(prefix, area),
            records: PhantomData,
        }
    }

    async fn read_all_items(&self) -> Result<Vec<(String, V)>> {
        Ok(self
            .view
            .get()
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(record) => Some((key, record)),
                Err(e) => {
                    warn!("Dropping unreadable record {:?}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    pub(crate) async fn read_all(&self) -> Result<Vec<V>> {
        Ok(self
            .read_all_items()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Returns the first record for which `test` holds.
    pub(crate) async fn read<F>(&self, test: F) -> Result<Option<V>>
    where
        F: Fn(&V) -> bool + Send,
    {
        Ok(self
            .read_all_items()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| test(record)))
    }

    pub(crate) async fn add(&self, record: &V) -> Result<()> {
        self.view
            .set(Items::from([(
                rng::unique_id(),
                serde_json::to_value(record)?,
            )]))
            .await
    }

    /// Deletes every record for which `test` holds. Matching nothing is not
    /// an error.
    pub(crate) async fn delete<F>(&self, test: F) -> Result<()>
    where
        F: Fn(&V) -> bool + Send,
    {
        let keys: Vec<String> = self
            .read_all_items()
            .await?
            .into_iter()
            .filter(|(_, record)| test(record))
            .map(|(key, _)| key)
            .collect();

        if keys.is_empty() {
            return Ok(());
        }
        self.view.delete(&keys).await
    }
}

impl<V> IsPersistent for KeyStore<V> {
    fn is_persistent(&self) -> bool {
        self.view.is_persistent()
    }
}
