//! Provider-neutral provisioning surface.
//!
//! Every side effect the engine performs goes through [`CloudInfra`], which
//! translates logical requests into provider-specific [`ProvisionRequest`]s
//! and hands them to an injected [`Provisioner`].

pub mod azure;
pub mod gcp;
pub mod provisioner;

use crate::error::{InfraError, Result};
use crate::types::{
    AccessLevel, BucketPermission, CloudName, GroupRef, Principal, RegistryMembership,
    SecretMembership,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use provisioner::{ProvisionCall, ProvisionRequest, Provisioner, RecordingProvisioner};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Roles and resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "role", content = "level", rename_all = "snake_case")]
pub enum Role {
    Bucket(BucketPermission),
    Secret(SecretMembership),
    Registry(RegistryMembership),
    CloudRunInvoker,
    ServiceAccountUser,
    LogViewer,
    BatchBillingMember,
    DataprocWorker,
    DataprocAdmin,
    /// Runs pipelines through the life sciences API.
    WorkflowsRunner,
    /// Organisation-defined project role, referenced by id.
    ProjectCustom(String),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Bucket(p) => write!(f, "bucket-{}", p.as_str()),
            Role::Secret(m) => write!(f, "secret-{}", m.as_str()),
            Role::Registry(m) => write!(f, "registry-{}", m.as_str()),
            Role::CloudRunInvoker => f.write_str("cloud-run-invoker"),
            Role::ServiceAccountUser => f.write_str("service-account-user"),
            Role::LogViewer => f.write_str("log-viewer"),
            Role::BatchBillingMember => f.write_str("batch-billing-member"),
            Role::DataprocWorker => f.write_str("dataproc-worker"),
            Role::DataprocAdmin => f.write_str("dataproc-admin"),
            Role::WorkflowsRunner => f.write_str("workflows-runner"),
            Role::ProjectCustom(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceRef {
    Bucket { name: String },
    Secret { name: String },
    Registry { name: String },
    Project { id: String },
    ServiceAccount { id: String },
    CloudRunService { name: String },
    /// Every resource of one dataset at one sensitivity tier.
    AccessTier { dataset: String, level: AccessLevel },
    BatchBillingProject { name: String },
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Bucket { name } => write!(f, "bucket/{name}"),
            ResourceRef::Secret { name } => write!(f, "secret/{name}"),
            ResourceRef::Registry { name } => write!(f, "registry/{name}"),
            ResourceRef::Project { id } => write!(f, "project/{id}"),
            ResourceRef::ServiceAccount { id } => write!(f, "service-account/{id}"),
            ResourceRef::CloudRunService { name } => write!(f, "cloud-run/{name}"),
            ResourceRef::AccessTier { dataset, level } => write!(f, "tier/{dataset}/{level}"),
            ResourceRef::BatchBillingProject { name } => write!(f, "batch-billing/{name}"),
        }
    }
}

/// `(principal, resource, role)`. The set of bindings on a resource is the
/// union of every request for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleBinding {
    pub principal: Principal,
    pub resource: ResourceRef,
    pub role: Role,
}

impl RoleBinding {
    pub fn new(principal: Principal, resource: ResourceRef, role: Role) -> Self {
        Self {
            principal,
            resource,
            role,
        }
    }
}

/// Bindings already granted during this run, across both clouds.
#[derive(Debug, Default)]
pub struct BindingLedger {
    seen: Mutex<BTreeSet<(CloudName, RoleBinding)>>,
}

impl BindingLedger {
    /// Returns false if the binding was already recorded.
    pub fn record(&self, cloud: CloudName, binding: &RoleBinding) -> bool {
        lock(&self.seen).insert((cloud, binding.clone()))
    }

    pub fn forget(&self, cloud: CloudName, binding: &RoleBinding) {
        lock(&self.seen).remove(&(cloud, binding.clone()));
    }

    pub fn bindings(&self) -> Vec<(CloudName, RoleBinding)> {
        lock(&self.seen).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LifecycleRule {
    Delete { age_days: u32 },
    DeleteNoncurrent { age_days: u32 },
    SoftDelete { days: u32 },
    SetTier { tier: String, age_days: u32 },
    AbortIncompleteUpload { age_days: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOptions {
    pub autoclass: bool,
    pub versioning: bool,
    pub requester_pays: bool,
    /// Use the name verbatim instead of deriving it from the dataset.
    pub unique: bool,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            autoclass: true,
            versioning: false,
            requester_pays: false,
            unique: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketHandle {
    pub cloud: CloudName,
    pub key: String,
    pub name: String,
    pub id: String,
}

impl BucketHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::Bucket {
            name: self.name.clone(),
        }
    }
}

/// A machine identity, created this run or referenced from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHandle {
    pub cloud: CloudName,
    pub key: String,
    pub id: String,
    pub created: bool,
}

impl IdentityHandle {
    pub fn existing(cloud: CloudName, key: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            cloud,
            key: key.into(),
            id: id.into(),
            created: false,
        }
    }

    pub fn principal(&self) -> Principal {
        Principal::service_account(self.id.clone())
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef::ServiceAccount {
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHandle {
    pub cloud: CloudName,
    pub key: String,
    pub name: String,
    pub id: String,
}

impl SecretHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::Secret {
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryHandle {
    pub cloud: CloudName,
    pub key: String,
    pub name: String,
    pub id: String,
}

impl RegistryHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::Registry {
            name: self.name.clone(),
        }
    }
}

/// A GCP project or an Azure resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHandle {
    pub cloud: CloudName,
    pub key: String,
    pub name: String,
    pub id: String,
}

impl ProjectHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::Project {
            id: self.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CloudInfra
// ---------------------------------------------------------------------------

/// Capability surface shared by every provider. Every `key` is the stable
/// logical name of the resource within the run.
pub trait CloudInfra: Send + Sync {
    fn name(&self) -> CloudName;

    fn bucket_rule_undelete(&self, days: u32) -> LifecycleRule;
    fn bucket_rule_temporary(&self, days: u32) -> LifecycleRule;
    fn bucket_rule_archive(&self, days: u32) -> LifecycleRule;

    fn create_project(&self, key: &str, name: &str) -> Result<ProjectHandle>;

    fn create_bucket(
        &self,
        key: &str,
        name: &str,
        project: &ProjectHandle,
        lifecycle_rules: Vec<LifecycleRule>,
        options: &BucketOptions,
    ) -> Result<BucketHandle>;

    fn create_service_account(
        &self,
        key: &str,
        name: &str,
        project: &ProjectHandle,
    ) -> Result<IdentityHandle>;

    fn create_secret(
        &self,
        key: &str,
        name: &str,
        value: Option<&str>,
        project: &ProjectHandle,
    ) -> Result<SecretHandle>;

    fn create_registry(&self, key: &str, name: &str, project: &ProjectHandle)
        -> Result<RegistryHandle>;

    fn create_budget(
        &self,
        key: &str,
        project: &ProjectHandle,
        amount: i64,
        currency: &str,
    ) -> Result<()>;

    fn create_group(&self, key: &str, group: &GroupRef) -> Result<()>;

    fn add_group_member(&self, key: &str, group: &GroupRef, member: &Principal) -> Result<()>;

    /// Grant a role. Returns false when the binding had already been granted
    /// this run and nothing was sent.
    fn grant_role(&self, key: &str, binding: &RoleBinding) -> Result<bool>;

    fn upload_blob(&self, key: &str, bucket: &str, path: &str, contents: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Backend: shared plumbing for provider implementations
// ---------------------------------------------------------------------------

pub(crate) struct Backend {
    pub cloud: CloudName,
    pub provisioner: Arc<dyn Provisioner>,
    pub ledger: Arc<BindingLedger>,
}

impl Backend {
    pub fn new(
        cloud: CloudName,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<BindingLedger>,
    ) -> Self {
        Self {
            cloud,
            provisioner,
            ledger,
        }
    }

    pub fn call(&self, key: &str, request: ProvisionRequest) -> Result<String> {
        let call = ProvisionCall {
            cloud: self.cloud,
            key: key.to_string(),
            request,
        };
        tracing::debug!(cloud = %self.cloud, key, kind = call.request.kind(), "provision");
        self.provisioner
            .provision(&call)
            .map_err(|message| InfraError::Provisioning {
                resource_key: key.to_string(),
                message,
            })
    }

    /// Send a grant through the ledger so each binding is applied once.
    pub fn grant(
        &self,
        key: &str,
        binding: &RoleBinding,
        role: String,
        resource: String,
    ) -> Result<bool> {
        if !self.ledger.record(self.cloud, binding) {
            tracing::debug!(cloud = %self.cloud, key, "binding already granted");
            return Ok(false);
        }
        let request = ProvisionRequest::RoleGrant {
            member: binding.principal.member_key(),
            resource,
            role,
        };
        match self.call(key, request) {
            Ok(_) => Ok(true),
            Err(e) => {
                self.ledger.forget(self.cloud, binding);
                Err(e)
            }
        }
    }

    pub fn unsupported(&self, capability: &'static str) -> InfraError {
        InfraError::UnsupportedCapability {
            cloud: self.cloud,
            capability,
        }
    }
}

/// Role bindings on engine-internal resources never reach a cloud.
pub(crate) fn not_a_cloud_resource(key: &str, resource: &ResourceRef) -> InfraError {
    InfraError::Provisioning {
        resource_key: key.to_string(),
        message: format!("{resource} is not a cloud resource"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_deduplicates_per_cloud() {
        let ledger = BindingLedger::default();
        let binding = RoleBinding::new(
            Principal::user("a@x.org"),
            ResourceRef::Bucket {
                name: "cpg-fewgenomes-main".into(),
            },
            Role::Bucket(BucketPermission::Read),
        );
        assert!(ledger.record(CloudName::Gcp, &binding));
        assert!(!ledger.record(CloudName::Gcp, &binding));
        assert!(ledger.record(CloudName::Azure, &binding));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn roles_render_as_slugs() {
        assert_eq!(Role::Bucket(BucketPermission::Mutate).to_string(), "bucket-mutate");
        assert_eq!(
            Role::Registry(RegistryMembership::Reader).to_string(),
            "registry-reader"
        );
        assert_eq!(Role::ServiceAccountUser.to_string(), "service-account-user");
        assert_eq!(Role::WorkflowsRunner.to_string(), "workflows-runner");
    }

    #[test]
    fn resource_refs_render_readably() {
        let tier = ResourceRef::AccessTier {
            dataset: "fewgenomes".into(),
            level: AccessLevel::Test,
        };
        assert_eq!(tier.to_string(), "tier/fewgenomes/test");
    }
}
