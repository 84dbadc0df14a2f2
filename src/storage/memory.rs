// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{self, Result};

use super::{Area, IsPersistent, Items};

/// A volatile area. Clones share the same contents.
#[derive(Clone, Default)]
pub(crate) struct Memory {
    items: Arc<RwLock<Items>>,
    quota: Option<usize>,
}

impl Memory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rejects any item whose key and serialized value together exceed
    /// `quota` bytes, as browser sync storage does.
    #[cfg(test)]
    pub(crate) fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    fn check_quota(&self, items: &Items) -> Result<()> {
        let Some(quota) = self.quota else {
            return Ok(());
        };

        for (key, value) in items {
            let size = key.len() + serde_json::to_string(value)?.len();
            if size > quota {
                return Err(error::Storage::Quota {
                    key: key.clone(),
                    size,
                    quota,
                }
                .into());
            }
        }

        Ok(())
    }
}

impl IsPersistent for Memory {
    fn is_persistent(&self) -> bool {
        false
    }
}

#[async_trait]
impl Area for Memory {
    async fn set(&self, items: Items) -> Result<()> {
        self.check_quota(&items)?;

        let mut guard = self.items.write().await;
        guard.extend(items);
        Ok(())
    }

    async fn get(&self) -> Result<Items> {
        let guard = self.items.read().await;
        Ok(guard.clone())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.items.write().await;
        for key in keys {
            _ = guard.remove(key);
        }
        Ok(())
    }
}
