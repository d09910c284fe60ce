use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::class::ClassFleet;
use crate::errors::StoreError;

/// Where class fleet records live. The relational store of the surrounding
/// application implements this; [`InMemoryFleetStore`] is the bundled one.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn load(&self, class_id: &str) -> Result<Option<ClassFleet>, StoreError>;

    async fn save(&self, fleet: &ClassFleet) -> Result<(), StoreError>;

    async fn remove(&self, class_id: &str) -> Result<Option<ClassFleet>, StoreError>;

    async fn list(&self) -> Result<Vec<ClassFleet>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryFleetStore {
    classes: RwLock<HashMap<String, ClassFleet>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FleetStore for InMemoryFleetStore {
    async fn load(&self, class_id: &str) -> Result<Option<ClassFleet>, StoreError> {
        Ok(self.classes.read().await.get(class_id).cloned())
    }

    async fn save(&self, fleet: &ClassFleet) -> Result<(), StoreError> {
        self.classes
            .write()
            .await
            .insert(fleet.class_id.clone(), fleet.clone());
        Ok(())
    }

    async fn remove(&self, class_id: &str) -> Result<Option<ClassFleet>, StoreError> {
        Ok(self.classes.write().await.remove(class_id))
    }

    async fn list(&self) -> Result<Vec<ClassFleet>, StoreError> {
        let mut classes: Vec<ClassFleet> = self.classes.read().await.values().cloned().collect();
        classes.sort_by(|a, b| a.class_id.cmp(&b.class_id));
        Ok(classes)
    }
}
