// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{error::Result, metadata};

use super::{Area, IsPersistent, Items};

/// An area kept as a single JSON object in a file.
pub(crate) struct File {
    path: PathBuf,
    persistent: bool,
    lock: Mutex<()>,
}

impl File {
    fn new(path: PathBuf, persistent: bool) -> Self {
        Self {
            path,
            persistent,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn persistent<P: AsRef<Path>>(file: P) -> Option<Self> {
        metadata::PROJECT_DIRS
            .as_ref()
            .map(|dirs| Self::new(dirs.data_dir().join(file), true))
    }

    pub(crate) fn persistent_at(path: PathBuf) -> Self {
        Self::new(path, true)
    }

    /// A file in the per-user runtime directory, which does not outlive the
    /// login session.
    pub(crate) fn session<P: AsRef<Path>>(file: P) -> Option<Self> {
        metadata::PROJECT_DIRS
            .as_ref()
            .and_then(|dirs| dirs.runtime_dir())
            .map(|dir| Self::new(dir.join(file), false))
    }

    fn read(&self) -> Result<Items> {
        match fs::File::open(&self.path) {
            Ok(fp) => Ok(serde_json::from_reader::<fs::File, Items>(fp)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Items::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, items: &Items) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = self.path.with_extension("tmp");
        let mut options = fs::OpenOptions::new();
        _ = options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            _ = options.mode(0o600);
        }

        let mut file = options.open(&staging)?;
        serde_json::to_writer(&mut file, items)?;
        file.flush()?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl IsPersistent for File {
    fn is_persistent(&self) -> bool {
        self.persistent
    }
}

#[async_trait]
impl Area for File {
    async fn set(&self, items: Items) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut current = self.read()?;
        current.extend(items);
        self.write(&current)
    }

    async fn get(&self) -> Result<Items> {
        let _guard = self.lock.lock().await;
        self.read()
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut current = self.read()?;
        let before = current.len();
        for key in keys {
            _ = current.remove(key);
        }

        if current.len() == before {
            return Ok(());
        }
        self.write(&current)
    }
}
