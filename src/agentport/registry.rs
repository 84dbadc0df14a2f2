// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc};

use super::AgentPort;

/// Tracks the port attached to each live channel.
///
/// Channels are matched by reference identity: two distinct channel objects
/// never share a port, however alike they are. Each channel gets an index the
/// first time it is seen, and ports are stored by index.
pub(crate) struct Registry<C> {
    next_index: usize,
    ports: HashMap<usize, Arc<AgentPort>>,
    channels: Vec<(Arc<C>, usize)>,
}

impl<C> Registry<C> {
    pub(crate) fn new() -> Self {
        Self {
            next_index: 0,
            ports: HashMap::new(),
            channels: Vec::new(),
        }
    }

    fn position(&self, channel: &Arc<C>) -> Option<usize> {
        self.channels
            .iter()
            .position(|&(ref candidate, _)| Arc::ptr_eq(candidate, channel))
    }

    /// Binds `port` to `channel`, replacing any port it already had.
    pub(crate) fn add(&mut self, channel: Arc<C>, port: Arc<AgentPort>) {
        let index = match self.position(&channel) {
            Some(pos) => self.channels[pos].1,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.channels.push((channel, index));
                index
            }
        };
        _ = self.ports.insert(index, port);
    }

    pub(crate) fn lookup(&self, channel: &Arc<C>) -> Option<Arc<AgentPort>> {
        self.position(channel)
            .and_then(|pos| self.ports.get(&self.channels[pos].1))
            .map(Arc::clone)
    }

    pub(crate) fn delete(&mut self, channel: &Arc<C>) -> Option<Arc<AgentPort>> {
        let pos = self.position(channel)?;
        let (_, index) = self.channels.swap_remove(pos);
        self.ports.remove(&index)
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        agentport::{Channel, Frame},
        error::Result,
    };

    #[derive(PartialEq)]
    struct Silent(u8);

    #[async_trait]
    impl Channel for Silent {
        async fn post_message(&self, _frame: Frame) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    fn port() -> Arc<AgentPort> {
        let (port, _stream) = AgentPort::new(Arc::new(Silent(0)));
        Arc::new(port)
    }

    #[tokio::test]
    async fn channels_are_matched_by_identity() {
        let mut registry = Registry::new();
        let first = Arc::new(Silent(0));
        let second = Arc::new(Silent(0));
        assert!(*first == *second);

        let first_port = port();
        let second_port = port();
        registry.add(Arc::clone(&first), Arc::clone(&first_port));
        registry.add(Arc::clone(&second), Arc::clone(&second_port));
        assert_eq!(registry.len(), 2);

        let found = registry.lookup(&first);
        assert!(found.is_some_and(|p| Arc::ptr_eq(&p, &first_port)));
        let found = registry.lookup(&second);
        assert!(found.is_some_and(|p| Arc::ptr_eq(&p, &second_port)));
        assert!(registry.lookup(&Arc::new(Silent(0))).is_none());
    }

    #[tokio::test]
    async fn delete_unbinds_only_that_channel() {
        let mut registry = Registry::new();
        let first = Arc::new(Silent(0));
        let second = Arc::new(Silent(0));
        registry.add(Arc::clone(&first), port());
        registry.add(Arc::clone(&second), port());

        let replacement = port();
        registry.add(Arc::clone(&first), Arc::clone(&replacement));
        assert_eq!(registry.len(), 2);

        let removed = registry.delete(&first);
        assert!(removed.is_some_and(|p| Arc::ptr_eq(&p, &replacement)));
        assert!(registry.lookup(&first).is_none());
        assert!(registry.lookup(&second).is_some());
        assert!(registry.delete(&first).is_none());
        assert_eq!(registry.len(), 1);
    }
}
