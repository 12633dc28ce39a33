//! Two-phase group membership: accumulate freely, seal once, push the sealed
//! snapshot to every target.

use crate::cloud::lock;
use crate::error::{InfraError, Result};
use crate::types::{CloudName, GroupKind, GroupRef, Principal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// GroupRegistry
// ---------------------------------------------------------------------------

enum Phase {
    Accumulating(BTreeMap<GroupRef, BTreeSet<Principal>>),
    Finalized,
}

pub struct GroupRegistry {
    phase: Mutex<Phase>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Accumulating(BTreeMap::new())),
        }
    }
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group so it is pushed even if it never gains members.
    pub fn placeholder(&self, group: &GroupRef) -> Result<()> {
        match &mut *lock(&self.phase) {
            Phase::Accumulating(groups) => {
                groups.entry(group.clone()).or_default();
                Ok(())
            }
            Phase::Finalized => Err(InfraError::GroupsFinalized {
                group: group.name.clone(),
            }),
        }
    }

    /// Add a member. Returns false if it was already present.
    pub fn add_member(&self, group: &GroupRef, member: Principal) -> Result<bool> {
        match &mut *lock(&self.phase) {
            Phase::Accumulating(groups) => {
                Ok(groups.entry(group.clone()).or_default().insert(member))
            }
            Phase::Finalized => Err(InfraError::GroupsFinalized {
                group: group.name.clone(),
            }),
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(*lock(&self.phase), Phase::Finalized)
    }

    /// Freeze membership. Only the first call succeeds.
    pub fn seal(&self) -> Result<MembershipSnapshot> {
        let mut phase = lock(&self.phase);
        match std::mem::replace(&mut *phase, Phase::Finalized) {
            Phase::Accumulating(groups) => Ok(MembershipSnapshot::build(groups)),
            Phase::Finalized => Err(InfraError::GroupsFinalized {
                group: "*".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MembershipSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMembers {
    pub group: GroupRef,
    /// Members as added, nested groups included.
    pub direct: BTreeSet<Principal>,
    /// Users and machine identities reachable through nesting.
    pub flattened: BTreeSet<Principal>,
}

/// Immutable membership, obtainable only by sealing a registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MembershipSnapshot {
    groups: Vec<GroupMembers>,
}

impl MembershipSnapshot {
    fn build(groups: BTreeMap<GroupRef, BTreeSet<Principal>>) -> Self {
        let by_address: BTreeMap<(CloudName, &str), &GroupRef> = groups
            .keys()
            .map(|g| ((g.cloud, g.address.as_str()), g))
            .collect();

        let flatten = |root: &GroupRef| {
            let mut flat = BTreeSet::new();
            let mut seen = BTreeSet::from([root.clone()]);
            let mut queue = vec![root.clone()];
            while let Some(group) = queue.pop() {
                for member in groups.get(&group).into_iter().flatten() {
                    match member {
                        Principal::Group(nested) => {
                            // nested refs may come from another registry entry with the same address
                            let nested = by_address
                                .get(&(nested.cloud, nested.address.as_str()))
                                .map(|g| (*g).clone())
                                .unwrap_or_else(|| nested.clone());
                            if seen.insert(nested.clone()) {
                                queue.push(nested);
                            }
                        }
                        other => {
                            flat.insert(other.clone());
                        }
                    }
                }
            }
            flat
        };

        let groups = groups
            .iter()
            .map(|(group, direct)| GroupMembers {
                group: group.clone(),
                direct: direct.clone(),
                flattened: flatten(group),
            })
            .collect();
        Self { groups }
    }

    pub fn groups(&self) -> &[GroupMembers] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, cloud: CloudName, name: &str) -> Option<&GroupMembers> {
        self.groups
            .iter()
            .find(|g| g.group.cloud == cloud && g.group.name == name)
    }

    pub fn for_cloud(&self, cloud: CloudName) -> impl Iterator<Item = &GroupMembers> {
        self.groups.iter().filter(move |g| g.group.cloud == cloud)
    }

    pub fn of_kind(
        &self,
        cloud: CloudName,
        dataset: &str,
        kind: GroupKind,
    ) -> Option<&GroupMembers> {
        self.groups.iter().find(|g| {
            g.group.cloud == cloud && g.group.dataset == dataset && g.group.kind == kind
        })
    }

    pub fn datasets(&self, cloud: CloudName) -> BTreeSet<&str> {
        self.for_cloud(cloud)
            .map(|g| g.group.dataset.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

/// A failure pushing one group (or the whole snapshot) to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPushError {
    pub group: String,
    pub message: String,
}

impl GroupPushError {
    pub fn new(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
        }
    }
}

/// An external system that mirrors group membership.
pub trait GroupTarget: Send + Sync {
    fn id(&self) -> String;

    /// Push the snapshot. Every group is attempted; failures are returned.
    fn push(&self, snapshot: &MembershipSnapshot) -> Vec<GroupPushError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub target: String,
    pub group: String,
    pub message: String,
}

impl From<TargetFailure> for InfraError {
    fn from(f: TargetFailure) -> Self {
        InfraError::FinalizeTarget {
            target: f.target,
            group: f.group,
            message: f.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub applied: Vec<String>,
    pub failures: Vec<TargetFailure>,
}

impl FinalizeReport {
    pub fn failed_targets(&self) -> BTreeSet<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Push one sealed snapshot to every target. No retries.
pub fn finalize(
    snapshot: &MembershipSnapshot,
    targets: &[Arc<dyn GroupTarget>],
) -> FinalizeReport {
    let mut report = FinalizeReport::default();
    for target in targets {
        let id = target.id();
        let errors = target.push(snapshot);
        if errors.is_empty() {
            tracing::info!(target = %id, groups = snapshot.len(), "group target applied");
            report.applied.push(id);
            continue;
        }
        for e in errors {
            tracing::warn!(target = %id, group = %e.group, "group push failed: {}", e.message);
            report.failures.push(TargetFailure {
                target: id.clone(),
                group: e.group,
                message: e.message,
            });
        }
    }
    report
}
