use super::{
    not_a_cloud_resource, Backend, BindingLedger, BucketHandle, BucketOptions, CloudInfra,
    IdentityHandle, LifecycleRule, ProjectHandle, Provisioner, ProvisionRequest, RegistryHandle,
    ResourceRef, Role, RoleBinding, SecretHandle,
};
use crate::config::{GcpOrgConfig, OrgConfig};
use crate::error::{ConfigError, ConfigIssue, Result};
use crate::types::{
    BucketPermission, CloudName, GroupRef, Principal, RegistryMembership, SecretMembership,
};
use std::sync::Arc;

const ABORT_INCOMPLETE_UPLOAD_DAYS: u32 = 7;

pub struct GcpInfra {
    settings: GcpOrgConfig,
    thresholds: Vec<f64>,
    backend: Backend,
}

impl GcpInfra {
    pub fn new(
        org: &OrgConfig,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<BindingLedger>,
    ) -> Result<Self> {
        let settings = org.gcp.clone().ok_or_else(|| ConfigError {
            issues: vec![ConfigIssue::new("infrastructure.gcp", "is required")],
        })?;
        Ok(Self {
            settings,
            thresholds: org.budget_notification_thresholds.clone(),
            backend: Backend::new(CloudName::Gcp, provisioner, ledger),
        })
    }

    /// Storage roles are organisation-level custom roles when an organisation
    /// is configured, predefined roles otherwise.
    fn bucket_role(&self, permission: BucketPermission) -> String {
        match &self.settings.organization {
            Some(org) => {
                let role = match permission {
                    BucketPermission::Mutate => "StorageObjectAndBucketMutator",
                    BucketPermission::Append => "StorageViewerAndCreator",
                    BucketPermission::Read => "StorageObjectAndBucketViewer",
                    BucketPermission::List => "StorageLister",
                };
                format!("{org}/roles/{role}")
            }
            None => match permission {
                BucketPermission::Mutate => "roles/storage.objectAdmin",
                BucketPermission::Append => "roles/storage.objectCreator",
                BucketPermission::Read => "roles/storage.objectViewer",
                BucketPermission::List => "roles/storage.legacyBucketReader",
            }
            .to_string(),
        }
    }

    fn role_name(&self, key: &str, binding: &RoleBinding) -> Result<String> {
        let role = match &binding.role {
            Role::Bucket(p) => self.bucket_role(*p),
            Role::Secret(SecretMembership::Admin) => {
                "roles/secretmanager.secretVersionManager".to_string()
            }
            Role::Secret(SecretMembership::Accessor) => {
                "roles/secretmanager.secretAccessor".to_string()
            }
            Role::Registry(RegistryMembership::Reader) => {
                "roles/artifactregistry.reader".to_string()
            }
            Role::Registry(RegistryMembership::Writer) => {
                "roles/artifactregistry.writer".to_string()
            }
            Role::CloudRunInvoker => "roles/run.invoker".to_string(),
            Role::ServiceAccountUser => "roles/iam.serviceAccountUser".to_string(),
            Role::LogViewer => "roles/logging.viewer".to_string(),
            Role::DataprocWorker => "roles/dataproc.worker".to_string(),
            Role::DataprocAdmin => "roles/dataproc.admin".to_string(),
            Role::WorkflowsRunner => "roles/lifesciences.workflowsRunner".to_string(),
            Role::ProjectCustom(id) => id.clone(),
            Role::BatchBillingMember => {
                return Err(not_a_cloud_resource(key, &binding.resource));
            }
        };
        Ok(role)
    }
}

impl CloudInfra for GcpInfra {
    fn name(&self) -> CloudName {
        CloudName::Gcp
    }

    fn bucket_rule_undelete(&self, days: u32) -> LifecycleRule {
        LifecycleRule::DeleteNoncurrent { age_days: days }
    }

    fn bucket_rule_temporary(&self, days: u32) -> LifecycleRule {
        LifecycleRule::Delete { age_days: days }
    }

    fn bucket_rule_archive(&self, days: u32) -> LifecycleRule {
        LifecycleRule::SetTier {
            tier: "ARCHIVE".to_string(),
            age_days: days,
        }
    }

    fn create_project(&self, key: &str, name: &str) -> Result<ProjectHandle> {
        let billing_account = Some(self.settings.billing_account.clone())
            .filter(|b| !b.is_empty());
        let id = self.backend.call(
            key,
            ProvisionRequest::Project {
                name: name.to_string(),
                billing_account,
            },
        )?;
        Ok(ProjectHandle {
            cloud: CloudName::Gcp,
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
        mut lifecycle_rules: Vec<LifecycleRule>,
        options: &BucketOptions,
    ) -> Result<BucketHandle> {
        lifecycle_rules.push(LifecycleRule::AbortIncompleteUpload {
            age_days: ABORT_INCOMPLETE_UPLOAD_DAYS,
        });
        let id = self.backend.call(
            key,
            ProvisionRequest::Bucket {
                name: name.to_string(),
                project: project.name.clone(),
                location: self.settings.region.clone(),
                lifecycle_rules,
                autoclass: options.autoclass,
                versioning: options.versioning,
                requester_pays: options.requester_pays,
            },
        )?;
        Ok(BucketHandle {
            cloud: CloudName::Gcp,
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
            cloud: CloudName::Gcp,
            key: key.to_string(),
            id: format!("{name}@{}.iam.gserviceaccount.com", project.name),
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
            cloud: CloudName::Gcp,
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
        let id = self.backend.call(
            key,
            ProvisionRequest::Registry {
                name: name.to_string(),
                project: project.name.clone(),
                location: self.settings.region.clone(),
            },
        )?;
        Ok(RegistryHandle {
            cloud: CloudName::Gcp,
            key: key.to_string(),
            name: name.to_string(),
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
            .grant(key, binding, role, binding.resource.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::RecordingProvisioner;
    use crate::naming;
    use crate::testutil;

    fn infra() -> (GcpInfra, Arc<RecordingProvisioner>) {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let gcp = GcpInfra::new(&config.org, rec.clone(), Arc::new(BindingLedger::default()))
            .unwrap();
        (gcp, rec)
    }

    fn project(gcp: &GcpInfra) -> ProjectHandle {
        gcp.create_project("p", "fewgenomes").unwrap()
    }

    #[test]
    fn buckets_always_abort_incomplete_uploads() {
        let (gcp, rec) = infra();
        let p = project(&gcp);
        let rules = vec![gcp.bucket_rule_temporary(naming::TMP_DAYS)];
        gcp.create_bucket("b", "cpg-fewgenomes-main-tmp", &p, rules, &BucketOptions::default())
            .unwrap();
        let calls = rec.calls();
        match &calls[1].request {
            ProvisionRequest::Bucket {
                lifecycle_rules,
                location,
                ..
            } => {
                assert_eq!(lifecycle_rules.len(), 2);
                assert!(matches!(
                    lifecycle_rules[1],
                    LifecycleRule::AbortIncompleteUpload { .. }
                ));
                assert_eq!(location, "australia-southeast1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn service_accounts_get_iam_addresses() {
        let (gcp, _) = infra();
        let p = project(&gcp);
        let sa = gcp.create_service_account("sa", "notebook-fewgenomes", &p).unwrap();
        assert_eq!(sa.id, "notebook-fewgenomes@fewgenomes.iam.gserviceaccount.com");
        assert!(sa.created);
    }

    #[test]
    fn grants_are_deduplicated_and_mapped() {
        let (gcp, rec) = infra();
        let binding = RoleBinding::new(
            Principal::user("alice@example.org"),
            ResourceRef::Bucket {
                name: "cpg-fewgenomes-main".into(),
            },
            Role::Bucket(BucketPermission::Read),
        );
        assert!(gcp.grant_role("g", &binding).unwrap());
        assert!(!gcp.grant_role("g", &binding).unwrap());
        assert_eq!(rec.count("role_grant"), 1);
        match &rec.calls()[0].request {
            ProvisionRequest::RoleGrant { role, member, .. } => {
                assert_eq!(role, "roles/storage.objectViewer");
                assert_eq!(member, "user:alice@example.org");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_grants_can_be_retried() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new().failing_when(|c| c.key == "bad"));
        let gcp = GcpInfra::new(&config.org, rec.clone(), Arc::new(BindingLedger::default()))
            .unwrap();
        let binding = RoleBinding::new(
            Principal::user("alice@example.org"),
            ResourceRef::Project {
                id: "fewgenomes".into(),
            },
            Role::LogViewer,
        );
        assert!(gcp.grant_role("bad", &binding).is_err());
        assert!(gcp.grant_role("good", &binding).unwrap());
    }

    #[test]
    fn engine_resources_are_rejected() {
        let (gcp, rec) = infra();
        let binding = RoleBinding::new(
            Principal::user("alice@example.org"),
            ResourceRef::BatchBillingProject {
                name: "fewgenomes".into(),
            },
            Role::BatchBillingMember,
        );
        assert!(gcp.grant_role("x", &binding).is_err());
        assert_eq!(rec.calls().len(), 0);
    }
}
