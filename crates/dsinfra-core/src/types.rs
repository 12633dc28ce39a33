use crate::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// CloudName
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudName {
    Gcp,
    Azure,
}

impl CloudName {
    pub fn all() -> &'static [CloudName] {
        &[CloudName::Gcp, CloudName::Azure]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloudName::Gcp => "gcp",
            CloudName::Azure => "azure",
        }
    }
}

impl fmt::Display for CloudName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudName {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gcp" => Ok(CloudName::Gcp),
            "azure" => Ok(CloudName::Azure),
            _ => Err(InfraError::InvalidCloud(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// AccessLevel
// ---------------------------------------------------------------------------

/// Sensitivity tier. Ordering is meaningful: `Test < Standard < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Test,
    Standard,
    Full,
}

impl AccessLevel {
    pub fn all() -> &'static [AccessLevel] {
        &[AccessLevel::Test, AccessLevel::Standard, AccessLevel::Full]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Test => "test",
            AccessLevel::Standard => "standard",
            AccessLevel::Full => "full",
        }
    }

    /// Every tier an identity at this level may read in another dataset.
    pub fn readable_levels(self) -> impl Iterator<Item = AccessLevel> {
        AccessLevel::all().iter().copied().filter(move |l| *l <= self)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(AccessLevel::Test),
            // "main" is the historical name of the standard tier
            "standard" | "main" => Ok(AccessLevel::Standard),
            "full" => Ok(AccessLevel::Full),
            _ => Err(InfraError::InvalidAccessLevel(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MetadataPermission
// ---------------------------------------------------------------------------

/// Access to the sample metadata service's main or test project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataPermission {
    MainRead,
    MainWrite,
    TestRead,
    TestWrite,
}

impl MetadataPermission {
    pub fn all() -> &'static [MetadataPermission] {
        &[
            MetadataPermission::MainRead,
            MetadataPermission::MainWrite,
            MetadataPermission::TestRead,
            MetadataPermission::TestWrite,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetadataPermission::MainRead => "main-read",
            MetadataPermission::MainWrite => "main-write",
            MetadataPermission::TestRead => "test-read",
            MetadataPermission::TestWrite => "test-write",
        }
    }

    /// Permissions held by the machine identities of one access level.
    pub fn for_level(level: AccessLevel) -> &'static [MetadataPermission] {
        match level {
            AccessLevel::Test => &[
                MetadataPermission::MainRead,
                MetadataPermission::TestRead,
                MetadataPermission::TestWrite,
            ],
            AccessLevel::Standard => &[MetadataPermission::MainRead, MetadataPermission::MainWrite],
            AccessLevel::Full => MetadataPermission::all(),
        }
    }
}

impl fmt::Display for MetadataPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetadataPermission {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataPermission::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| InfraError::InvalidGroupKind(format!("sample-metadata-{s}")))
    }
}

// ---------------------------------------------------------------------------
// GroupKind
// ---------------------------------------------------------------------------

/// The role a dataset group plays. Rendered as the suffix of the group name,
/// e.g. `fewgenomes-data-manager` or `fewgenomes-test-read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GroupKind {
    Access,
    DataManager,
    Analysis,
    MetadataAccess,
    WebAccess,
    ReleaseAccess,
    Upload,
    InternalOperators,
    /// Machine identities working at one access level.
    Level(AccessLevel),
    /// Principals granted read on one tier of this dataset by other datasets.
    Reader(AccessLevel),
    /// Callers of the sample metadata service for this dataset.
    SampleMetadata(MetadataPermission),
}

impl GroupKind {
    /// Kinds that may appear as keys of the membership document.
    pub fn assignable() -> &'static [GroupKind] {
        &[
            GroupKind::Access,
            GroupKind::DataManager,
            GroupKind::Analysis,
            GroupKind::MetadataAccess,
            GroupKind::WebAccess,
            GroupKind::ReleaseAccess,
            GroupKind::Upload,
        ]
    }

    pub fn is_assignable(self) -> bool {
        GroupKind::assignable().contains(&self)
    }

    /// Groups this kind's group is itself a member of, within one dataset.
    pub fn nested_into(self) -> &'static [GroupKind] {
        match self {
            GroupKind::DataManager => &[
                GroupKind::Analysis,
                GroupKind::MetadataAccess,
                GroupKind::WebAccess,
                GroupKind::Upload,
            ],
            GroupKind::Analysis => &[GroupKind::Access],
            _ => &[],
        }
    }

    pub fn suffix(self) -> String {
        match self {
            GroupKind::Access => "access".to_string(),
            GroupKind::DataManager => "data-manager".to_string(),
            GroupKind::Analysis => "analysis".to_string(),
            GroupKind::MetadataAccess => "metadata-access".to_string(),
            GroupKind::WebAccess => "web-access".to_string(),
            GroupKind::ReleaseAccess => "release-access".to_string(),
            GroupKind::Upload => "upload".to_string(),
            GroupKind::InternalOperators => "internal-operators".to_string(),
            GroupKind::Level(level) => level.as_str().to_string(),
            GroupKind::Reader(level) => format!("{level}-read"),
            GroupKind::SampleMetadata(permission) => format!("sample-metadata-{permission}"),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

impl std::str::FromStr for GroupKind {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => return Ok(GroupKind::Access),
            "data-manager" => return Ok(GroupKind::DataManager),
            "analysis" => return Ok(GroupKind::Analysis),
            "metadata-access" => return Ok(GroupKind::MetadataAccess),
            "web-access" => return Ok(GroupKind::WebAccess),
            "release-access" => return Ok(GroupKind::ReleaseAccess),
            "upload" => return Ok(GroupKind::Upload),
            "internal-operators" => return Ok(GroupKind::InternalOperators),
            _ => {}
        }
        if let Some(permission) = s.strip_prefix("sample-metadata-") {
            return permission.parse().map(GroupKind::SampleMetadata);
        }
        if let Some(level) = s.strip_suffix("-read") {
            return level
                .parse()
                .map(GroupKind::Reader)
                .map_err(|_| InfraError::InvalidGroupKind(s.to_string()));
        }
        s.parse()
            .map(GroupKind::Level)
            .map_err(|_| InfraError::InvalidGroupKind(s.to_string()))
    }
}

impl TryFrom<String> for GroupKind {
    type Error = InfraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GroupKind> for String {
    fn from(kind: GroupKind) -> Self {
        kind.suffix()
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Optional feature sets a dataset can deploy on a cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Storage,
    HailAccounts,
    ContainerRegistry,
    AnalysisRunner,
    Notebooks,
    Budget,
    Spark,
    Cromwell,
    #[serde(alias = "sample_metadata")]
    SampleMetadata,
}

impl Component {
    pub fn all() -> &'static [Component] {
        &[
            Component::Storage,
            Component::HailAccounts,
            Component::ContainerRegistry,
            Component::AnalysisRunner,
            Component::Notebooks,
            Component::Budget,
            Component::Spark,
            Component::Cromwell,
            Component::SampleMetadata,
        ]
    }

    /// Components deployed when a dataset lists none for `cloud`. Spark,
    /// cromwell and sample metadata depend on org-wide services and are
    /// opt-in everywhere.
    pub fn defaults_for(cloud: CloudName) -> Vec<Component> {
        match cloud {
            CloudName::Gcp => vec![
                Component::Storage,
                Component::HailAccounts,
                Component::ContainerRegistry,
                Component::AnalysisRunner,
                Component::Notebooks,
                Component::Budget,
            ],
            CloudName::Azure => vec![
                Component::Storage,
                Component::HailAccounts,
                Component::ContainerRegistry,
                Component::AnalysisRunner,
                Component::Budget,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Storage => "storage",
            Component::HailAccounts => "hail-accounts",
            Component::ContainerRegistry => "container-registry",
            Component::AnalysisRunner => "analysis-runner",
            Component::Notebooks => "notebooks",
            Component::Budget => "budget",
            Component::Spark => "spark",
            Component::Cromwell => "cromwell",
            Component::SampleMetadata => "sample-metadata",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Component {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('_', "-");
        Component::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| InfraError::InvalidComponent(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Memberships on resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketPermission {
    List,
    Read,
    Append,
    Mutate,
}

impl BucketPermission {
    pub fn as_str(self) -> &'static str {
        match self {
            BucketPermission::List => "list",
            BucketPermission::Read => "read",
            BucketPermission::Append => "append",
            BucketPermission::Mutate => "mutate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretMembership {
    Accessor,
    Admin,
}

impl SecretMembership {
    pub fn as_str(self) -> &'static str {
        match self {
            SecretMembership::Accessor => "accessor",
            SecretMembership::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryMembership {
    Reader,
    Writer,
}

impl RegistryMembership {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistryMembership::Reader => "reader",
            RegistryMembership::Writer => "writer",
        }
    }
}

// ---------------------------------------------------------------------------
// GroupRef / Principal
// ---------------------------------------------------------------------------

/// Logical reference to an access group on one cloud. The address is known
/// before the group exists, so grants can name it ahead of finalize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupRef {
    pub cloud: CloudName,
    pub dataset: String,
    pub kind: GroupKind,
    pub name: String,
    pub address: String,
}

/// Anything that can be granted a role or be a group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    User { id: String },
    ServiceAccount { id: String },
    Group(GroupRef),
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Principal::User { id: id.into() }
    }

    pub fn service_account(id: impl Into<String>) -> Self {
        Principal::ServiceAccount { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Principal::User { id } | Principal::ServiceAccount { id } => id,
            Principal::Group(g) => &g.address,
        }
    }

    pub fn as_group(&self) -> Option<&GroupRef> {
        match self {
            Principal::Group(g) => Some(g),
            _ => None,
        }
    }

    /// IAM-style member key, e.g. `serviceAccount:x@p.iam.gserviceaccount.com`.
    pub fn member_key(&self) -> String {
        match self {
            Principal::User { id } => format!("user:{id}"),
            Principal::ServiceAccount { id } => format!("serviceAccount:{id}"),
            Principal::Group(g) => format!("group:{}", g.address),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.member_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_levels_never_exceed_own_level() {
        let test: Vec<_> = AccessLevel::Test.readable_levels().collect();
        assert_eq!(test, vec![AccessLevel::Test]);
        let full: Vec<_> = AccessLevel::Full.readable_levels().collect();
        assert_eq!(full.len(), 3);
    }

    #[test]
    fn main_is_an_alias_for_standard() {
        assert_eq!("main".parse::<AccessLevel>().unwrap(), AccessLevel::Standard);
        assert!("admin".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn group_kind_parses_every_suffix() {
        for kind in [
            GroupKind::Access,
            GroupKind::DataManager,
            GroupKind::InternalOperators,
            GroupKind::Level(AccessLevel::Full),
            GroupKind::Reader(AccessLevel::Test),
            GroupKind::SampleMetadata(MetadataPermission::MainRead),
            GroupKind::SampleMetadata(MetadataPermission::TestWrite),
        ] {
            assert_eq!(kind.suffix().parse::<GroupKind>().unwrap(), kind);
        }
        assert!("test-write".parse::<GroupKind>().is_err());
        assert!("sample-metadata-full-read".parse::<GroupKind>().is_err());
    }

    #[test]
    fn group_kind_yaml_uses_suffix() {
        let yaml = serde_yaml::to_string(&GroupKind::Reader(AccessLevel::Standard)).unwrap();
        assert!(yaml.contains("standard-read"));
        let parsed: GroupKind = serde_yaml::from_str("data-manager").unwrap();
        assert_eq!(parsed, GroupKind::DataManager);
    }

    #[test]
    fn only_user_facing_kinds_are_assignable() {
        assert!(GroupKind::Analysis.is_assignable());
        assert!(!GroupKind::Level(AccessLevel::Test).is_assignable());
        assert!(!GroupKind::InternalOperators.is_assignable());
    }

    #[test]
    fn azure_defaults_exclude_notebooks() {
        assert!(Component::defaults_for(CloudName::Gcp).contains(&Component::Notebooks));
        assert!(!Component::defaults_for(CloudName::Azure).contains(&Component::Notebooks));
        assert_eq!(
            "container-registry".parse::<Component>().unwrap(),
            Component::ContainerRegistry
        );
    }

    #[test]
    fn service_backed_components_are_opt_in() {
        for cloud in CloudName::all() {
            let defaults = Component::defaults_for(*cloud);
            assert!(!defaults.contains(&Component::Spark));
            assert!(!defaults.contains(&Component::Cromwell));
            assert!(!defaults.contains(&Component::SampleMetadata));
        }
        assert_eq!(
            "sample_metadata".parse::<Component>().unwrap(),
            Component::SampleMetadata
        );
        let parsed: Vec<Component> = serde_yaml::from_str("[spark, sample_metadata]").unwrap();
        assert_eq!(parsed, vec![Component::Spark, Component::SampleMetadata]);
    }

    #[test]
    fn metadata_permissions_widen_with_level() {
        assert!(!MetadataPermission::for_level(AccessLevel::Test)
            .contains(&MetadataPermission::MainWrite));
        assert!(!MetadataPermission::for_level(AccessLevel::Standard)
            .contains(&MetadataPermission::TestRead));
        assert_eq!(MetadataPermission::for_level(AccessLevel::Full).len(), 4);
    }

    #[test]
    fn principal_member_keys() {
        assert_eq!(Principal::user("a@x.org").member_key(), "user:a@x.org");
        assert_eq!(
            Principal::service_account("sa@p.iam.gserviceaccount.com").to_string(),
            "serviceAccount:sa@p.iam.gserviceaccount.com"
        );
    }
}
