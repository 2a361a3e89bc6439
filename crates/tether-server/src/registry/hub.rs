//! Account → registry actor lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::AccountId;
use tokio::sync::mpsc;

use super::actor::AccountRegistry;
use super::{Command, RegistryContext, RegistryHandle};

/// Commands buffered per account before senders wait.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Finds or spawns the registry actor for an account.
///
/// The hub keeps only weak senders, so an actor lives exactly as long as
/// some socket task or in-flight caller holds a [`RegistryHandle`].
pub struct RegistryHub {
    ctx: Arc<RegistryContext>,
    actors: Mutex<HashMap<AccountId, mpsc::WeakSender<Command>>>,
}

impl RegistryHub {
    /// Create a hub sharing `ctx` with every actor it spawns.
    pub fn new(ctx: Arc<RegistryContext>) -> Self {
        Self {
            ctx,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Shared actor dependencies.
    pub fn context(&self) -> &Arc<RegistryContext> {
        &self.ctx
    }

    /// Handle to the account's actor, spawning one if none is running.
    pub fn handle(&self, account_id: &AccountId) -> RegistryHandle {
        let mut actors = self.actors.lock();
        if let Some(tx) = actors.get(account_id).and_then(mpsc::WeakSender::upgrade) {
            return RegistryHandle::new(account_id.clone(), tx);
        }

        actors.retain(|_, weak| weak.upgrade().is_some());
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let generation = self.ctx.directory.next_generation();
        let actor = AccountRegistry::new(account_id.clone(), generation, Arc::clone(&self.ctx));
        let _ = tokio::spawn(actor.run(rx));
        let _ = actors.insert(account_id.clone(), tx.downgrade());
        RegistryHandle::new(account_id.clone(), tx)
    }

    /// Handle to the account's actor only if one is running.
    pub fn existing(&self, account_id: &AccountId) -> Option<RegistryHandle> {
        self.actors
            .lock()
            .get(account_id)
            .and_then(mpsc::WeakSender::upgrade)
            .map(|tx| RegistryHandle::new(account_id.clone(), tx))
    }

    /// Number of running actors.
    pub fn actor_count(&self) -> usize {
        self.actors
            .lock()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}
