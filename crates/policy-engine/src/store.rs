use std::sync::Arc;

use anyhow::Result;

use devicewarden_core::policy::PolicyDocument;
use devicewarden_core::store::{keys, load_json, save_json, KeyValueStore};

/// Owner of the persisted "current policy".
#[derive(Clone)]
pub struct PolicyStore {
    store: Arc<dyn KeyValueStore>,
}

impl PolicyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Option<PolicyDocument>> {
        load_json(self.store.as_ref(), keys::CURRENT_POLICY)
    }

    pub fn save(&self, policy: &PolicyDocument) -> Result<()> {
        save_json(self.store.as_ref(), keys::CURRENT_POLICY, policy)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(keys::CURRENT_POLICY)
    }
}
