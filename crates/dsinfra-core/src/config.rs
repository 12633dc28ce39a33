use crate::deps;
use crate::error::{ConfigError, ConfigIssue, InfraError, Result};
use crate::naming;
use crate::types::{AccessLevel, CloudName, Component, GroupKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Org-level cloud settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpOrgConfig {
    pub region: String,
    pub groups_domain: String,
    pub dataset_storage_prefix: String,
    #[serde(default)]
    pub billing_account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureOrgConfig {
    pub region: String,
    pub subscription: String,
    pub tenant: String,
    pub dataset_storage_prefix: String,
}

// ---------------------------------------------------------------------------
// Well-known identities and users
// ---------------------------------------------------------------------------

/// Machine accounts owned by shared services rather than any dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAccounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_runner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_group_cache: Option<String>,
    /// Submits workflows on behalf of the per-level cromwell accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cromwell_runner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_runner_logger: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCloudIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hail_batch_username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub clouds: BTreeMap<CloudName, UserCloudIdentity>,
}

// ---------------------------------------------------------------------------
// Group targets
// ---------------------------------------------------------------------------

/// Where the flattened membership cache is written. Exactly one of
/// `local_dir` and `bucket` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipCacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default = "default_cache_cloud")]
    pub cloud: CloudName,
    #[serde(default = "default_cache_name")]
    pub name: String,
}

fn default_cache_cloud() -> CloudName {
    CloudName::Gcp
}

fn default_cache_name() -> String {
    "access-group-cache.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetamistConfig {
    pub url: String,
    /// Whose group members are reported as project members.
    #[serde(default = "default_cache_cloud")]
    pub identity_cloud: CloudName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HailBatchConfig {
    pub url: String,
    /// Whose user identities carry the batch usernames.
    #[serde(default = "default_cache_cloud")]
    pub identity_cloud: CloudName,
}

// ---------------------------------------------------------------------------
// OrgConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_common_dataset")]
    pub common_dataset: String,
    #[serde(default)]
    pub budget_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpOrgConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureOrgConfig>,
    #[serde(default)]
    pub service_accounts: ServiceAccounts,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default)]
    pub can_access_internal_dataset_logs: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub group_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_cache: Option<MembershipCacheConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metamist: Option<MetamistConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hail_batch: Option<HailBatchConfig>,
    #[serde(default)]
    pub disable_group_memberships: bool,
    #[serde(default = "default_thresholds")]
    pub budget_notification_thresholds: Vec<f64>,
}

fn default_common_dataset() -> String {
    "common".to_string()
}

fn default_thresholds() -> Vec<f64> {
    vec![0.5, 0.9, 1.0]
}

impl OrgConfig {
    pub fn user_identity(&self, member: &str, cloud: CloudName) -> Option<&UserCloudIdentity> {
        self.users.get(member).and_then(|u| u.clouds.get(&cloud))
    }

    pub fn storage_prefix(&self, cloud: CloudName) -> &str {
        match cloud {
            CloudName::Gcp => self
                .gcp
                .as_ref()
                .map(|g| g.dataset_storage_prefix.as_str())
                .unwrap_or(""),
            CloudName::Azure => self
                .azure
                .as_ref()
                .map(|a| a.dataset_storage_prefix.as_str())
                .unwrap_or(""),
        }
    }

    fn validate(&self, issues: &mut Vec<ConfigIssue>) {
        require(issues, "infrastructure.domain", &self.domain);
        require(issues, "infrastructure.budget_currency", &self.budget_currency);
        require(issues, "infrastructure.common_dataset", &self.common_dataset);

        if let Some(gcp) = &self.gcp {
            require(issues, "infrastructure.gcp.region", &gcp.region);
            require(issues, "infrastructure.gcp.groups_domain", &gcp.groups_domain);
            require(
                issues,
                "infrastructure.gcp.dataset_storage_prefix",
                &gcp.dataset_storage_prefix,
            );
        }
        if let Some(azure) = &self.azure {
            require(issues, "infrastructure.azure.region", &azure.region);
            require(issues, "infrastructure.azure.subscription", &azure.subscription);
            require(issues, "infrastructure.azure.tenant", &azure.tenant);
        }

        for (key, user) in &self.users {
            if user.clouds.is_empty() {
                issues.push(ConfigIssue::new(
                    format!("infrastructure.users.{key}.clouds"),
                    "must name at least one cloud identity",
                ));
            }
            for (cloud, identity) in &user.clouds {
                require(
                    issues,
                    &format!("infrastructure.users.{key}.clouds.{cloud}.id"),
                    &identity.id,
                );
            }
        }

        for (i, key) in self.can_access_internal_dataset_logs.iter().enumerate() {
            if !self.users.contains_key(key) {
                issues.push(ConfigIssue::new(
                    format!("infrastructure.can_access_internal_dataset_logs[{i}]"),
                    format!("unknown user '{key}'"),
                ));
            }
        }

        if let Some(cache) = &self.membership_cache {
            if cache.local_dir.is_some() == cache.bucket.is_some() {
                issues.push(ConfigIssue::new(
                    "infrastructure.membership_cache",
                    "exactly one of local_dir and bucket must be set",
                ));
            }
            require(issues, "infrastructure.membership_cache.name", &cache.name);
        }
        if let Some(metamist) = &self.metamist {
            require(issues, "infrastructure.metamist.url", &metamist.url);
        }
        if let Some(batch) = &self.hail_batch {
            require(issues, "infrastructure.hail_batch.url", &batch.url);
        }

        for (i, t) in self.budget_notification_thresholds.iter().enumerate() {
            if *t < 0.0 {
                issues.push(ConfigIssue::new(
                    format!("infrastructure.budget_notification_thresholds[{i}]"),
                    "must be non-negative",
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DatasetConfig
// ---------------------------------------------------------------------------

/// An existing batch identity the dataset already owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HailAccount {
    pub username: String,
    pub cloud_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetCloudConfig {
    /// GCP project id; defaults to the dataset name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub hail_accounts: BTreeMap<AccessLevel, HailAccount>,
    #[serde(default)]
    pub deployment_accounts: BTreeMap<AccessLevel, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_budget: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_total_budget: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default = "default_deploy_locations")]
    pub deploy_locations: Vec<String>,
    #[serde(default = "default_archive_age")]
    pub archive_age: i64,
    #[serde(default)]
    pub enable_release: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub depends_on_readonly: Vec<String>,
    #[serde(default)]
    pub is_internal_dataset: bool,
    #[serde(default)]
    pub gcp: DatasetCloudConfig,
    #[serde(default)]
    pub azure: DatasetCloudConfig,
    #[serde(default)]
    pub budgets: BTreeMap<CloudName, BudgetConfig>,
    #[serde(default)]
    pub enable_shared_project: bool,
    #[serde(default)]
    pub create_container_registry: bool,
    #[serde(default = "default_true")]
    pub autoclass: bool,
    #[serde(default = "default_true")]
    pub setup_test: bool,
    #[serde(default)]
    pub additional_upload_buckets: Vec<String>,
    /// Whether the metadata service keeps a project for this dataset.
    #[serde(default = "default_true")]
    pub enable_metamist_project: bool,
    /// Service accounts granted read access to the main metadata project.
    #[serde(default)]
    pub sm_read_only_sas: Vec<String>,
    /// Service accounts granted read and write access to the main metadata project.
    #[serde(default)]
    pub sm_read_write_sas: Vec<String>,
    /// Per-cloud component list. A missing cloud falls back to the cloud's
    /// defaults; an explicit empty list disables every component.
    #[serde(default)]
    pub components: BTreeMap<CloudName, Vec<Component>>,
    #[serde(skip)]
    clouds: Vec<CloudName>,
}

fn default_deploy_locations() -> Vec<String> {
    vec!["gcp".to_string()]
}

fn default_archive_age() -> i64 {
    naming::ARCHIVE_DAYS as i64
}

fn default_true() -> bool {
    true
}

impl DatasetConfig {
    /// Enabled clouds, in declaration order. Populated by validation.
    pub fn clouds(&self) -> &[CloudName] {
        &self.clouds
    }

    pub fn deploys_to(&self, cloud: CloudName) -> bool {
        self.clouds.contains(&cloud)
    }

    pub fn cloud(&self, cloud: CloudName) -> &DatasetCloudConfig {
        match cloud {
            CloudName::Gcp => &self.gcp,
            CloudName::Azure => &self.azure,
        }
    }

    pub fn components_for(&self, cloud: CloudName) -> Vec<Component> {
        self.components
            .get(&cloud)
            .cloned()
            .unwrap_or_else(|| Component::defaults_for(cloud))
    }

    pub fn has_component(&self, cloud: CloudName, component: Component) -> bool {
        self.components_for(cloud).contains(&component)
    }

    /// Access levels this dataset deploys identities for.
    pub fn access_levels(&self) -> Vec<AccessLevel> {
        AccessLevel::all()
            .iter()
            .copied()
            .filter(|l| self.setup_test || *l != AccessLevel::Test)
            .collect()
    }

    pub fn project_id(&self) -> &str {
        self.gcp.project.as_deref().unwrap_or(&self.name)
    }

    /// Every dataset this one reads from, deduplicated in declaration order.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.depends_on
            .iter()
            .chain(self.depends_on_readonly.iter())
            .map(String::as_str)
            .filter(|d| seen.insert(*d))
            .collect()
    }

    fn validate(
        &mut self,
        index: usize,
        org: &OrgConfig,
        names: &BTreeSet<&str>,
        issues: &mut Vec<ConfigIssue>,
    ) {
        let field = |f: &str| format!("datasets[{index}].{f}");

        if !naming::is_slug(&self.name) {
            issues.push(ConfigIssue::new(
                field("name"),
                format!("'{}' is not a valid dataset name", self.name),
            ));
        }

        self.clouds.clear();
        if self.deploy_locations.is_empty() {
            issues.push(ConfigIssue::new(field("deploy_locations"), "must not be empty"));
        }
        for (i, loc) in self.deploy_locations.iter().enumerate() {
            match loc.parse::<CloudName>() {
                Ok(cloud) if self.clouds.contains(&cloud) => issues.push(ConfigIssue::new(
                    field(&format!("deploy_locations[{i}]")),
                    format!("'{cloud}' listed twice"),
                )),
                Ok(cloud) => self.clouds.push(cloud),
                Err(e) => issues.push(ConfigIssue::new(
                    field(&format!("deploy_locations[{i}]")),
                    e.to_string(),
                )),
            }
        }
        for cloud in &self.clouds {
            let configured = match cloud {
                CloudName::Gcp => org.gcp.is_some(),
                CloudName::Azure => org.azure.is_some(),
            };
            if !configured {
                issues.push(ConfigIssue::new(
                    format!("infrastructure.{cloud}"),
                    format!("required by dataset '{}'", self.name),
                ));
            }
        }

        for (list, entries) in [
            ("depends_on", &self.depends_on),
            ("depends_on_readonly", &self.depends_on_readonly),
        ] {
            for (i, dep) in entries.iter().enumerate() {
                if dep == &self.name {
                    issues.push(ConfigIssue::new(
                        field(&format!("{list}[{i}]")),
                        "a dataset cannot depend on itself",
                    ));
                } else if !names.contains(dep.as_str()) {
                    issues.push(ConfigIssue::new(
                        field(&format!("{list}[{i}]")),
                        format!("unknown dataset '{dep}'"),
                    ));
                }
            }
        }

        if self.archive_age < 0 {
            issues.push(ConfigIssue::new(field("archive_age"), "must be non-negative"));
        } else if u32::try_from(self.archive_age).is_err() {
            issues.push(ConfigIssue::new(
                field("archive_age"),
                format!("must be at most {} days", u32::MAX),
            ));
        }
        for (cloud, budget) in &self.budgets {
            if budget.monthly_budget < 0 {
                issues.push(ConfigIssue::new(
                    field(&format!("budgets.{cloud}.monthly_budget")),
                    "must be non-negative",
                ));
            }
            if budget.shared_total_budget.is_some_and(|b| b < 0) {
                issues.push(ConfigIssue::new(
                    field(&format!("budgets.{cloud}.shared_total_budget")),
                    "must be non-negative",
                ));
            }
        }
        for (i, bucket) in self.additional_upload_buckets.iter().enumerate() {
            require(issues, &field(&format!("additional_upload_buckets[{i}]")), bucket);
        }
        for (list, entries) in [
            ("sm_read_only_sas", &self.sm_read_only_sas),
            ("sm_read_write_sas", &self.sm_read_write_sas),
        ] {
            for (i, sa) in entries.iter().enumerate() {
                require(issues, &field(&format!("{list}[{i}]")), sa);
            }
        }
    }
}

fn require(issues: &mut Vec<ConfigIssue>, field: &str, value: &str) {
    if value.trim().is_empty() {
        issues.push(ConfigIssue::new(field, "is required"));
    }
}

// ---------------------------------------------------------------------------
// RawDeployment / ValidatedConfig
// ---------------------------------------------------------------------------

/// The deployment document as read from disk, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDeployment {
    pub infrastructure: OrgConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

impl RawDeployment {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}

/// Immutable, validated deployment. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub org: Arc<OrgConfig>,
    datasets: BTreeMap<String, Arc<DatasetConfig>>,
    order: Vec<String>,
}

impl ValidatedConfig {
    pub fn dataset(&self, name: &str) -> Result<&Arc<DatasetConfig>> {
        self.datasets
            .get(name)
            .ok_or_else(|| InfraError::DatasetNotFound(name.to_string()))
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Arc<DatasetConfig>> {
        self.datasets.values()
    }

    /// Dataset names, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn common(&self) -> Result<&Arc<DatasetConfig>> {
        self.dataset(&self.org.common_dataset)
    }
}

/// Check the whole deployment and report every issue at once.
pub fn validate(raw: RawDeployment) -> std::result::Result<ValidatedConfig, ConfigError> {
    let RawDeployment {
        infrastructure: org,
        mut datasets,
    } = raw;
    let mut issues = Vec::new();
    org.validate(&mut issues);

    let names: BTreeSet<String> = datasets.iter().map(|d| d.name.clone()).collect();
    let name_refs: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let mut seen = BTreeSet::new();
    for (i, ds) in datasets.iter().enumerate() {
        if !seen.insert(ds.name.clone()) {
            issues.push(ConfigIssue::new(
                format!("datasets[{i}].name"),
                format!("duplicate dataset '{}'", ds.name),
            ));
        }
    }
    for (i, ds) in datasets.iter_mut().enumerate() {
        ds.validate(i, &org, &name_refs, &mut issues);
    }

    let commons = datasets
        .iter()
        .filter(|d| d.name == org.common_dataset)
        .count();
    if commons == 0 {
        issues.push(ConfigIssue::new(
            "datasets",
            format!("the common dataset '{}' is missing", org.common_dataset),
        ));
    }

    let edges: BTreeMap<String, Vec<String>> = datasets
        .iter()
        .map(|d| {
            let deps = d
                .dependencies()
                .into_iter()
                .filter(|dep| *dep != d.name && name_refs.contains(dep))
                .map(str::to_string)
                .collect();
            (d.name.clone(), deps)
        })
        .collect();
    let order = match deps::topological_order(&edges) {
        Ok(order) => order,
        Err(InfraError::DependencyCycle { cycle }) => {
            issues.push(ConfigIssue::new(
                "datasets",
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
            Vec::new()
        }
        Err(e) => {
            issues.push(ConfigIssue::new("datasets", e.to_string()));
            Vec::new()
        }
    };

    if !issues.is_empty() {
        return Err(ConfigError { issues });
    }

    Ok(ValidatedConfig {
        org: Arc::new(org),
        datasets: datasets
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect(),
        order,
    })
}

// ---------------------------------------------------------------------------
// MembershipDocument
// ---------------------------------------------------------------------------

/// `members.yaml`: dataset -> group kind -> user keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipDocument {
    pub datasets: BTreeMap<String, BTreeMap<GroupKind, Vec<String>>>,
}

impl MembershipDocument {
    /// A missing file is an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        match crate::io::read_optional(path)? {
            Some(data) => Self::parse(&data),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn members(&self, dataset: &str) -> impl Iterator<Item = (GroupKind, &str)> {
        self.datasets
            .get(dataset)
            .into_iter()
            .flat_map(|kinds| {
                kinds
                    .iter()
                    .flat_map(|(kind, keys)| keys.iter().map(move |k| (*kind, k.as_str())))
            })
    }

    pub fn validate(&self, config: &ValidatedConfig) -> std::result::Result<(), ConfigError> {
        let mut issues = Vec::new();
        for (dataset, kinds) in &self.datasets {
            if config.dataset(dataset).is_err() {
                issues.push(ConfigIssue::new(
                    format!("members.{dataset}"),
                    "unknown dataset",
                ));
            }
            for (kind, keys) in kinds {
                if !kind.is_assignable() {
                    issues.push(ConfigIssue::new(
                        format!("members.{dataset}.{kind}"),
                        "group is managed by the engine and cannot list members",
                    ));
                }
                for (i, key) in keys.iter().enumerate() {
                    if !config.org.users.contains_key(key) {
                        issues.push(ConfigIssue::new(
                            format!("members.{dataset}.{kind}[{i}]"),
                            format!("unknown user '{key}'"),
                        ));
                    }
                }
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { issues })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
