// =====================================================================================
// STATUS CARRIER HIERARCHY
// =====================================================================================
//
// Carriers (environments, process tasks, components, deployments) are owned by the
// domain model. The engine only needs to walk them, so it sees them through the
// `CarrierHierarchy` trait. `CarrierRegistry` is the in-process implementation used
// by the API binary and the tests.
//
// =====================================================================================

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::StatusError;

pub type CarrierId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CarrierKind {
    Environment,
    ProcessTask,
    Component,
    Deployment,
}

impl fmt::Display for CarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CarrierKind::Environment => "environment",
            CarrierKind::ProcessTask => "process_task",
            CarrierKind::Component => "component",
            CarrierKind::Deployment => "deployment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarrierRef {
    pub id: CarrierId,
    pub kind: CarrierKind,
    pub code: String,
    /// Only meaningful for deployments.
    pub location: Option<String>,
}

impl CarrierRef {
    pub fn new(kind: CarrierKind, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            code: code.into(),
            location: None,
        }
    }

    pub fn deployment(component_code: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: CarrierKind::Deployment,
            code: component_code.into(),
            location: Some(location.into()),
        }
    }

    /// Human readable key: the carrier code, or `component@location` for deployments.
    /// Not unique: per-kind aggregates merge carriers sharing a display code.
    pub fn display_code(&self) -> String {
        match (&self.kind, &self.location) {
            (CarrierKind::Deployment, Some(location)) => format!("{}@{}", self.code, location),
            _ => self.code.clone(),
        }
    }
}

#[async_trait]
pub trait CarrierHierarchy: Send + Sync {
    async fn carrier(&self, id: CarrierId) -> Option<CarrierRef>;

    async fn sub_carriers(&self, id: CarrierId) -> Vec<CarrierRef>;

    async fn associated_deployments(&self, id: CarrierId) -> Vec<CarrierRef>;

    async fn carriers_of_kind(&self, kind: CarrierKind) -> Vec<CarrierRef>;
}

/// Write side of the hierarchy, for installations where the engine owns the carrier
/// graph itself.
#[async_trait]
pub trait CarrierDirectory: CarrierHierarchy {
    async fn add_carrier(&self, carrier: CarrierRef) -> Result<CarrierRef, StatusError>;

    async fn add_sub_carrier(&self, parent: CarrierId, child: CarrierId) -> Result<(), StatusError>;

    async fn add_deployment(&self, owner: CarrierId, deployment: CarrierId) -> Result<(), StatusError>;
}

/// Every carrier reachable from `root` through sub-carrier links, plus the associated
/// deployments of each reached carrier when `include_deployments` is set. Carriers shared
/// by several parents are visited once.
pub async fn reachable_carriers(
    hierarchy: &dyn CarrierHierarchy,
    root: CarrierId,
    include_deployments: bool,
) -> HashSet<CarrierId> {
    let mut visited = HashSet::new();
    let mut pending = vec![root];

    while let Some(id) = pending.pop() {
        if !visited.insert(id) {
            continue;
        }

        for child in hierarchy.sub_carriers(id).await {
            if !visited.contains(&child.id) {
                pending.push(child.id);
            }
        }

        if include_deployments {
            for deployment in hierarchy.associated_deployments(id).await {
                if !visited.contains(&deployment.id) {
                    pending.push(deployment.id);
                }
            }
        }
    }

    visited
}

#[derive(Debug, Clone)]
struct CarrierNode {
    carrier: CarrierRef,
    sub_carriers: Vec<CarrierId>,
    deployments: Vec<CarrierId>,
}

pub struct CarrierRegistry {
    nodes: RwLock<HashMap<CarrierId, CarrierNode>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, carrier: CarrierRef) -> CarrierId {
        let id = carrier.id;
        let mut nodes = self.nodes.write().await;
        nodes.entry(id).or_insert_with(|| CarrierNode {
            carrier,
            sub_carriers: Vec::new(),
            deployments: Vec::new(),
        });
        id
    }

    pub async fn link_sub_carrier(&self, parent: CarrierId, child: CarrierId) -> Result<(), StatusError> {
        if parent == child {
            return Err(StatusError::ValidationError(format!(
                "carrier {} cannot contain itself",
                parent
            )));
        }
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(&child) {
            return Err(StatusError::NotFound(format!("carrier {}", child)));
        }
        let node = nodes
            .get_mut(&parent)
            .ok_or_else(|| StatusError::NotFound(format!("carrier {}", parent)))?;
        if !node.sub_carriers.contains(&child) {
            node.sub_carriers.push(child);
        }
        debug!("Linked carrier {} under {}", child, parent);
        Ok(())
    }

    pub async fn link_deployment(&self, owner: CarrierId, deployment: CarrierId) -> Result<(), StatusError> {
        let mut nodes = self.nodes.write().await;
        match nodes.get(&deployment) {
            Some(node) if node.carrier.kind == CarrierKind::Deployment => {}
            Some(_) => {
                return Err(StatusError::ValidationError(format!(
                    "carrier {} is not a deployment",
                    deployment
                )))
            }
            None => return Err(StatusError::NotFound(format!("carrier {}", deployment))),
        }
        let node = nodes
            .get_mut(&owner)
            .ok_or_else(|| StatusError::NotFound(format!("carrier {}", owner)))?;
        if !node.deployments.contains(&deployment) {
            node.deployments.push(deployment);
        }
        Ok(())
    }

    async fn resolve(&self, ids: impl IntoIterator<Item = CarrierId>) -> Vec<CarrierRef> {
        let nodes = self.nodes.read().await;
        ids.into_iter()
            .filter_map(|id| nodes.get(&id).map(|node| node.carrier.clone()))
            .collect()
    }
}

impl Default for CarrierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CarrierDirectory for CarrierRegistry {
    async fn add_carrier(&self, carrier: CarrierRef) -> Result<CarrierRef, StatusError> {
        if carrier.code.trim().is_empty() {
            return Err(StatusError::ValidationError("carrier code must not be empty".to_string()));
        }
        let has_location = carrier
            .location
            .as_deref()
            .is_some_and(|location| !location.trim().is_empty());
        if (carrier.kind == CarrierKind::Deployment) != has_location {
            return Err(StatusError::ValidationError(
                "a location is required for deployments and only for deployments".to_string(),
            ));
        }

        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&carrier.id) {
            return Err(StatusError::AlreadyExists(format!("carrier {}", carrier.id)));
        }
        nodes.insert(
            carrier.id,
            CarrierNode {
                carrier: carrier.clone(),
                sub_carriers: Vec::new(),
                deployments: Vec::new(),
            },
        );
        info!("Registered {} carrier {}", carrier.kind, carrier.display_code());
        Ok(carrier)
    }

    async fn add_sub_carrier(&self, parent: CarrierId, child: CarrierId) -> Result<(), StatusError> {
        CarrierRegistry::link_sub_carrier(self, parent, child).await
    }

    async fn add_deployment(&self, owner: CarrierId, deployment: CarrierId) -> Result<(), StatusError> {
        CarrierRegistry::link_deployment(self, owner, deployment).await
    }
}

#[async_trait]
impl CarrierHierarchy for CarrierRegistry {
    async fn carrier(&self, id: CarrierId) -> Option<CarrierRef> {
        let nodes = self.nodes.read().await;
        nodes.get(&id).map(|node| node.carrier.clone())
    }

    async fn sub_carriers(&self, id: CarrierId) -> Vec<CarrierRef> {
        let children = {
            let nodes = self.nodes.read().await;
            match nodes.get(&id) {
                Some(node) => node.sub_carriers.clone(),
                None => return Vec::new(),
            }
        };
        self.resolve(children).await
    }

    async fn associated_deployments(&self, id: CarrierId) -> Vec<CarrierRef> {
        let deployments = {
            let nodes = self.nodes.read().await;
            match nodes.get(&id) {
                Some(node) => node.deployments.clone(),
                None => return Vec::new(),
            }
        };
        self.resolve(deployments).await
    }

    async fn carriers_of_kind(&self, kind: CarrierKind) -> Vec<CarrierRef> {
        let nodes = self.nodes.read().await;
        let mut carriers: Vec<CarrierRef> = nodes
            .values()
            .filter(|node| node.carrier.kind == kind)
            .map(|node| node.carrier.clone())
            .collect();
        carriers.sort_by_key(|carrier| carrier.display_code());
        carriers
    }
}
