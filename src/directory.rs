use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::EngineError;
use crate::model::{Resource, ResourceId};

/// Read-only view of the resource catalog. Resource CRUD and search live
/// elsewhere; arbitration only needs a capacity lookup.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn lookup(&self, id: ResourceId) -> Result<Option<Resource>, EngineError>;
}

/// Directory backed by a map, for the binary and for tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    resources: DashMap<ResourceId, Resource>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: Resource) {
        self.resources.insert(resource.id, resource);
    }

    pub fn remove(&self, id: ResourceId) -> Option<Resource> {
        self.resources.remove(&id).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Parse a seed list of the form `id:seats[,id:seats]...`.
    pub fn parse_seed(seed: &str) -> Result<Vec<Resource>, EngineError> {
        seed.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (id, seats) = entry
                    .split_once(':')
                    .ok_or(EngineError::InvalidRequest("seed entry must be id:seats"))?;
                let id = id
                    .trim()
                    .parse()
                    .map_err(|_| EngineError::InvalidRequest("seed id must be an integer"))?;
                let seats = seats
                    .trim()
                    .parse()
                    .map_err(|_| EngineError::InvalidRequest("seed seats must be an integer"))?;
                Ok(Resource::new(id, seats))
            })
            .collect()
    }
}

#[async_trait]
impl ResourceDirectory for InMemoryDirectory {
    async fn lookup(&self, id: ResourceId) -> Result<Option<Resource>, EngineError> {
        Ok(self.resources.get(&id).map(|e| e.value().clone()))
    }
}
