//! Per-session context shared by every replication component.
//!
//! Holds what would otherwise be process-wide state: whether this side is
//! the host, the action registry, loaded configuration and the local
//! player's live input. Cloned behind an `Arc` into each constructor.

use std::sync::Arc;

use tidewire_core::config::TidewireConfig;
use tidewire_core::Guid;

use crate::input::{ActionRegistry, LocalInput};

pub struct NetContext {
    is_host: bool,
    actions: ActionRegistry,
    config: TidewireConfig,
    local_connection: Option<Guid>,
    local_input: Option<Arc<dyn LocalInput>>,
}

impl NetContext {
    pub fn host(config: TidewireConfig, actions: ActionRegistry) -> Self {
        Self {
            is_host: true,
            actions,
            config,
            local_connection: None,
            local_input: None,
        }
    }

    pub fn client(config: TidewireConfig, actions: ActionRegistry) -> Self {
        Self {
            is_host: false,
            ..Self::host(config, actions)
        }
    }

    /// Id of the host's self-connection, if one exists.
    pub fn with_local_connection(mut self, id: Guid) -> Self {
        self.local_connection = Some(id);
        self
    }

    pub fn with_local_input(mut self, input: Arc<dyn LocalInput>) -> Self {
        self.local_input = Some(input);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_client(&self) -> bool {
        !self.is_host
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn config(&self) -> &TidewireConfig {
        &self.config
    }

    pub fn local_connection(&self) -> Option<Guid> {
        self.local_connection
    }

    pub fn local_input(&self) -> Option<&Arc<dyn LocalInput>> {
        self.local_input.as_ref()
    }
}

impl std::fmt::Debug for NetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetContext")
            .field("is_host", &self.is_host)
            .field("actions", &self.actions.len())
            .field("local_connection", &self.local_connection)
            .field("local_input", &self.local_input.is_some())
            .finish()
    }
}
