use super::{
    not_a_cloud_resource, Backend, BindingLedger, BucketHandle, BucketOptions, CloudInfra,
    IdentityHandle, LifecycleRule, ProjectHandle, Provisioner, ProvisionRequest, RegistryHandle,
    ResourceRef, Role, RoleBinding, SecretHandle,
};
use crate::config::{AzureOrgConfig, OrgConfig};
use crate::error::{ConfigError, ConfigIssue, Result};
use crate::naming;
use crate::types::{
    BucketPermission, CloudName, GroupRef, Principal, RegistryMembership, SecretMembership,
};
use std::sync::Arc;

const STORAGE_ACCOUNT_MAX_LEN: usize = 24;

pub struct AzureInfra {
    settings: AzureOrgConfig,
    thresholds: Vec<f64>,
    backend: Backend,
}

impl AzureInfra {
    pub fn new(
        org: &OrgConfig,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<BindingLedger>,
    ) -> Result<Self> {
        let settings = org.azure.clone().ok_or_else(|| ConfigError {
            issues: vec![ConfigIssue::new("infrastructure.azure", "is required")],
        })?;
        Ok(Self {
            settings,
            thresholds: org.budget_notification_thresholds.clone(),
            backend: Backend::new(CloudName::Azure, provisioner, ledger),
        })
    }

    /// Containers live inside one storage account per resource group.
    pub fn storage_account(&self, project: &ProjectHandle) -> String {
        let mut name = naming::azure_alphanumeric(&format!(
            "{}{}",
            self.settings.dataset_storage_prefix, project.name
        ));
        name.truncate(STORAGE_ACCOUNT_MAX_LEN);
        name
    }

    fn role_name(&self, key: &str, binding: &RoleBinding) -> Result<&'static str> {
        let role = match &binding.role {
            Role::Bucket(BucketPermission::Mutate | BucketPermission::Append) => {
                "Storage Blob Data Contributor"
            }
            Role::Bucket(BucketPermission::Read | BucketPermission::List) => {
                "Storage Blob Data Reader"
            }
            Role::Secret(SecretMembership::Admin) => "Key Vault Secrets Officer",
            Role::Secret(SecretMembership::Accessor) => "Key Vault Secrets User",
            Role::Registry(RegistryMembership::Reader) => "AcrPull",
            Role::Registry(RegistryMembership::Writer) => "AcrPush",
            Role::ServiceAccountUser => "Managed Identity Operator",
            Role::LogViewer => "Log Analytics Reader",
            Role::CloudRunInvoker => return Err(self.backend.unsupported("cloud-run invoker")),
            Role::DataprocWorker | Role::DataprocAdmin => {
                return Err(self.backend.unsupported("dataproc"))
            }
            Role::WorkflowsRunner => return Err(self.backend.unsupported("life sciences workflows")),
            Role::ProjectCustom(_) => return Err(self.backend.unsupported("custom project roles")),
            Role::BatchBillingMember => {
                return Err(not_a_cloud_resource(key, &binding.resource));
            }
        };
        Ok(role)
    }
}

impl CloudInfra for AzureInfra {
    fn name(&self) -> CloudName {
        CloudName::Azure
    }

    fn bucket_rule_undelete(&self, days: u32) -> LifecycleRule {
        LifecycleRule::SoftDelete { days }
    }

    fn bucket_rule_temporary(&self, days: u32) -> LifecycleRule {
        LifecycleRule::Delete { age_days: days }
    }

    fn bucket_rule_archive(&self, days: u32) -> LifecycleRule {
        LifecycleRule::SetTier {
            tier: "Archive".to_string(),
            age_days: days,
        }
    }

    fn create_project(&self, key: &str, name: &str) -> Result<ProjectHandle> {
        let id = self.backend.call(
            key,
            ProvisionRequest::Project {
                name: name.to_string(),
                billing_account: Some(self.settings.subscription.clone()),
            },
        )?;
        Ok(ProjectHandle {
            cloud: CloudName::Azure,
            key: key.to_string(),
            name: name.to_string(),
            id,
        })
    }

    fn create_bucket(
        &self,
        key: &str,
        name: &str,
        project: &ProjectHandle,
        lifecycle_rules: Vec<LifecycleRule>,
        options: &BucketOptions,
    ) -> Result<BucketHandle> {
        if options.autoclass {
            tracing::debug!(key, "autoclass has no azure equivalent, ignoring");
        }
        let account = self.storage_account(project);
        let id = self.backend.call(
            key,
            ProvisionRequest::Bucket {
                name: format!("{account}/{name}"),
                project: project.name.clone(),
                location: self.settings.region.clone(),
                lifecycle_rules,
                autoclass: false,
                versioning: options.versioning,
                requester_pays: options.requester_pays,
            },
        )?;
        Ok(BucketHandle {
            cloud: CloudName::Azure,
            key: key.to_string(),
            name: name.to_string(),
            id,
        })
    }

    fn create_service_account(
        &self,
        key: &str,
        name: &str,
        project: &ProjectHandle,
    ) -> Result<IdentityHandle> {
        self.backend.call(
            key,
            ProvisionRequest::ServiceAccount {
                name: name.to_string(),
                project: project.name.clone(),
            },
        )?;
        Ok(IdentityHandle {
            cloud: CloudName::Azure,
            key: key.to_string(),
            id: format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{name}",
                self.settings.subscription, project.name
            ),
            created: true,
        })
    }

    fn create_secret(
        &self,
        key: &str,
        name: &str,
        value: Option<&str>,
        project: &ProjectHandle,
    ) -> Result<SecretHandle> {
        let id = self.backend.call(
            key,
            ProvisionRequest::Secret {
                name: name.to_string(),
                project: project.name.clone(),
                has_value: value.is_some(),
            },
        )?;
        Ok(SecretHandle {
            cloud: CloudName::Azure,
            key: key.to_string(),
            name: name.to_string(),
            id,
        })
    }

    fn create_registry(
        &self,
        key: &str,
        name: &str,
        project: &ProjectHandle,
    ) -> Result<RegistryHandle> {
        // registry names share the storage account alphabet
        let name = naming::azure_alphanumeric(name);
        let id = self.backend.call(
            key,
            ProvisionRequest::Registry {
                name: name.clone(),
                project: project.name.clone(),
                location: self.settings.region.clone(),
            },
        )?;
        Ok(RegistryHandle {
            cloud: CloudName::Azure,
            key: key.to_string(),
            name,
            id,
        })
    }

    fn create_budget(
        &self,
        key: &str,
        project: &ProjectHandle,
        amount: i64,
        currency: &str,
    ) -> Result<()> {
        self.backend.call(
            key,
            ProvisionRequest::Budget {
                project: project.name.clone(),
                amount,
                currency: currency.to_string(),
                thresholds: self.thresholds.clone(),
            },
        )?;
        Ok(())
    }

    fn create_group(&self, key: &str, group: &GroupRef) -> Result<()> {
        self.backend.call(
            key,
            ProvisionRequest::Group {
                name: group.name.clone(),
                address: group.address.clone(),
            },
        )?;
        Ok(())
    }

    fn add_group_member(&self, key: &str, group: &GroupRef, member: &Principal) -> Result<()> {
        self.backend.call(
            key,
            ProvisionRequest::GroupMember {
                group: group.address.clone(),
                member: member.id().to_string(),
            },
        )?;
        Ok(())
    }

    fn grant_role(&self, key: &str, binding: &RoleBinding) -> Result<bool> {
        if matches!(
            binding.resource,
            ResourceRef::AccessTier { .. } | ResourceRef::BatchBillingProject { .. }
        ) {
            return Err(not_a_cloud_resource(key, &binding.resource));
        }
        let role = self.role_name(key, binding)?;
        self.backend
            .grant(key, binding, role.to_string(), binding.resource.to_string())
    }

    fn upload_blob(&self, key: &str, bucket: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.backend.call(
            key,
            ProvisionRequest::Blob {
                bucket: bucket.to_string(),
                path: path.to_string(),
                size: contents.len(),
            },
        )?;
        Ok(())
    }
}
