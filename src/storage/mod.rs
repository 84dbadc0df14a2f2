// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Flat key-value storage areas holding JSON values, and the layers that
//! build typed record stores on top of them.

mod chunked;
mod file;
mod memory;
mod typed;
mod view;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub(crate) use chunked::Chunked;
pub(crate) use file::File;
pub(crate) use memory::Memory;
pub(crate) use typed::KeyStore;
pub(crate) use view::View;

pub(crate) const DEFAULT_MAX_ITEM_BYTES: usize = 8192;
pub(crate) const PERSISTENT_FILE: &str = "keys.json";
pub(crate) const SESSION_FILE: &str = "session.json";

pub(crate) type Items = HashMap<String, serde_json::Value>;

pub(crate) trait IsPersistent {
    fn is_persistent(&self) -> bool;
}

impl<T: IsPersistent + ?Sized> IsPersistent for Box<T> {
    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }
}

/// A storage area in the style of a browser extension's storage API: every
/// operation works on a batch of keys, and reads return the whole area.
#[async_trait]
pub(crate) trait Area: Send + Sync + IsPersistent {
    async fn set(&self, items: Items) -> Result<()>;
    async fn get(&self) -> Result<Items>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

#[async_trait]
impl<T: Area + ?Sized> Area for Box<T> {
    async fn set(&self, items: Items) -> Result<()> {
        (**self).set(items).await
    }

    async fn get(&self) -> Result<Items> {
        (**self).get().await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        (**self).delete(keys).await
    }
}
