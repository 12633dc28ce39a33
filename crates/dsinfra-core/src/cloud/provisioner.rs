use super::{lock, LifecycleRule};
use crate::types::CloudName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// ProvisionRequest / ProvisionCall
// ---------------------------------------------------------------------------

/// A provider-specific request, already translated from the logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionRequest {
    Project {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        billing_account: Option<String>,
    },
    Bucket {
        name: String,
        project: String,
        location: String,
        lifecycle_rules: Vec<LifecycleRule>,
        autoclass: bool,
        versioning: bool,
        requester_pays: bool,
    },
    ServiceAccount {
        name: String,
        project: String,
    },
    Secret {
        name: String,
        project: String,
        /// Secret payloads are never recorded.
        has_value: bool,
    },
    Registry {
        name: String,
        project: String,
        location: String,
    },
    Budget {
        project: String,
        amount: i64,
        currency: String,
        thresholds: Vec<f64>,
    },
    Group {
        name: String,
        address: String,
    },
    GroupMember {
        group: String,
        member: String,
    },
    RoleGrant {
        member: String,
        resource: String,
        role: String,
    },
    Blob {
        bucket: String,
        path: String,
        size: usize,
    },
}

impl ProvisionRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionRequest::Project { .. } => "project",
            ProvisionRequest::Bucket { .. } => "bucket",
            ProvisionRequest::ServiceAccount { .. } => "service_account",
            ProvisionRequest::Secret { .. } => "secret",
            ProvisionRequest::Registry { .. } => "registry",
            ProvisionRequest::Budget { .. } => "budget",
            ProvisionRequest::Group { .. } => "group",
            ProvisionRequest::GroupMember { .. } => "group_member",
            ProvisionRequest::RoleGrant { .. } => "role_grant",
            ProvisionRequest::Blob { .. } => "blob",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionCall {
    pub cloud: CloudName,
    pub key: String,
    pub request: ProvisionRequest,
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// The opaque side-effecting layer underneath [`super::CloudInfra`].
/// Returns the provider's id for the resource, or a failure message.
pub trait Provisioner: Send + Sync {
    fn provision(&self, call: &ProvisionCall) -> Result<String, String>;
}

type FailWhen = Box<dyn Fn(&ProvisionCall) -> bool + Send + Sync>;

/// Records every call instead of touching a cloud. Used for dry runs and as
/// the test double; failures can be injected with [`Self::failing_when`].
#[derive(Default)]
pub struct RecordingProvisioner {
    calls: Mutex<Vec<ProvisionCall>>,
    fail_when: Option<FailWhen>,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_when(
        mut self,
        predicate: impl Fn(&ProvisionCall) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.request.kind() == kind)
            .count()
    }

    pub fn count_where(&self, predicate: impl Fn(&ProvisionCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| predicate(c)).count()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for call in lock(&self.calls).iter() {
            *counts.entry(call.request.kind()).or_insert(0) += 1;
        }
        counts
    }
}

impl Provisioner for RecordingProvisioner {
    fn provision(&self, call: &ProvisionCall) -> Result<String, String> {
        lock(&self.calls).push(call.clone());
        if self.fail_when.as_ref().is_some_and(|f| f(call)) {
            tracing::debug!(key = %call.key, "injected failure");
            return Err(format!("injected failure for {}", call.key));
        }
        Ok(format!("{}://{}", call.cloud, call.key))
    }
}
