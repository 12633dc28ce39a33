//! Per-dataset, per-cloud resource graph.
//!
//! Every resource is behind a memoized accessor: the first call provisions
//! it through [`CloudInfra`] and caches the handle (or the failure), later
//! calls return the cache. Resources nobody asks for are never created.

use crate::cloud::{
    lock, BucketHandle, BucketOptions, CloudInfra, IdentityHandle, LifecycleRule, ProjectHandle,
    RegistryHandle, ResourceRef, Role, RoleBinding, SecretHandle,
};
use crate::config::{DatasetConfig, OrgConfig, ValidatedConfig};
use crate::error::{InfraError, Result};
use crate::groups::GroupRegistry;
use crate::naming;
use crate::types::{
    AccessLevel, BucketPermission, CloudName, Component, GroupKind, GroupRef, MetadataPermission,
    Principal, RegistryMembership, SecretMembership,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError, Weak};
use std::thread::{self, ThreadId};

// ---------------------------------------------------------------------------
// Memo
// ---------------------------------------------------------------------------

const MAX_ACCESSOR_DEPTH: usize = 64;

thread_local! {
    static ACTIVE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks a key as being built on this thread for as long as it lives.
struct AccessorGuard;

impl AccessorGuard {
    fn enter(key: &str) -> Result<Self> {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if active.len() >= MAX_ACCESSOR_DEPTH || active.iter().any(|k| k == key) {
                return Err(InfraError::AccessorCycle {
                    key: key.to_string(),
                });
            }
            active.push(key.to_string());
            Ok(AccessorGuard)
        })
    }
}

impl Drop for AccessorGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

type Cell<V> = Option<std::result::Result<V, InfraError>>;
type Slot<V> = Arc<Mutex<Cell<V>>>;

/// Which thread holds each slot and which slot each blocked thread waits on.
/// The thread-local stack only sees one thread; this catches cycles that
/// span several.
#[derive(Default)]
struct WaitGraph {
    owners: HashMap<usize, ThreadId>,
    waiting: HashMap<ThreadId, usize>,
}

impl WaitGraph {
    fn global() -> &'static Mutex<WaitGraph> {
        static GRAPH: OnceLock<Mutex<WaitGraph>> = OnceLock::new();
        GRAPH.get_or_init(Mutex::default)
    }

    /// True if waiting on `slot` would leave `me` waiting on itself.
    fn closes_cycle(&self, mut slot: usize, me: ThreadId) -> bool {
        for _ in 0..=self.waiting.len() {
            let Some(owner) = self.owners.get(&slot) else {
                return false;
            };
            if *owner == me {
                return true;
            }
            match self.waiting.get(owner) {
                Some(next) => slot = *next,
                None => return false,
            }
        }
        false
    }
}

/// Records the current thread as the holder of a slot until dropped.
struct SlotOwner {
    slot: usize,
}

impl SlotOwner {
    fn claim(slot: usize) -> Self {
        lock(WaitGraph::global())
            .owners
            .insert(slot, thread::current().id());
        SlotOwner { slot }
    }
}

impl Drop for SlotOwner {
    fn drop(&mut self) {
        lock(WaitGraph::global()).owners.remove(&self.slot);
    }
}

fn slot_id<V>(slot: &Slot<V>) -> usize {
    Arc::as_ptr(slot) as usize
}

/// Lock a slot, refusing to block when the holder is (transitively) waiting
/// on this thread.
fn acquire<'a, V>(slot: &'a Slot<V>, key: &str) -> Result<MutexGuard<'a, Cell<V>>> {
    match slot.try_lock() {
        Ok(cell) => return Ok(cell),
        Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => {}
    }

    let me = thread::current().id();
    {
        let mut graph = lock(WaitGraph::global());
        if graph.closes_cycle(slot_id(slot), me) {
            return Err(InfraError::AccessorCycle {
                key: key.to_string(),
            });
        }
        graph.waiting.insert(me, slot_id(slot));
    }
    let cell = lock(slot);
    lock(WaitGraph::global()).waiting.remove(&me);
    Ok(cell)
}

/// Per-key acquire-once cache. Concurrent first calls for one key serialize
/// on that key's slot; different keys never block each other. An accessor
/// that needs, directly or through other threads, a key it is already
/// building fails with [`InfraError::AccessorCycle`] instead of blocking.
pub struct Memo<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V> Default for Memo<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Memo<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(&self, key: &str, init: impl FnOnce() -> Result<V>) -> Result<V> {
        let slot = lock(&self.slots).entry(key.to_string()).or_default().clone();
        // checked before taking the slot lock, which is not re-entrant
        let _guard = AccessorGuard::enter(key)?;
        let mut cell = acquire(&slot, key)?;
        let _owner = SlotOwner::claim(slot_id(&slot));
        match cell.get_or_insert_with(init) {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.replay()),
        }
    }

    /// Number of keys that have been resolved, successfully or not.
    pub fn resolved(&self) -> usize {
        let slots: Vec<Slot<V>> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|s| lock(s).is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// GraphSet
// ---------------------------------------------------------------------------

/// Every dataset graph of one run, addressable by `(dataset, cloud)`.
pub struct GraphSet {
    graphs: BTreeMap<(String, CloudName), Arc<DatasetCloudGraph>>,
    groups: Arc<GroupRegistry>,
}

impl GraphSet {
    /// Graphs are created for every enabled cloud that has an implementation
    /// in `infras`. Nothing is provisioned here.
    pub fn build(
        config: &ValidatedConfig,
        infras: &BTreeMap<CloudName, Arc<dyn CloudInfra>>,
        groups: Arc<GroupRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|set| {
            let mut graphs = BTreeMap::new();
            for dataset in config.datasets() {
                for cloud in dataset.clouds() {
                    let Some(infra) = infras.get(cloud) else {
                        continue;
                    };
                    let graph = DatasetCloudGraph {
                        dataset: Arc::clone(dataset),
                        org: Arc::clone(&config.org),
                        infra: Arc::clone(infra),
                        groups: Arc::clone(&groups),
                        set: set.clone(),
                        projects: Memo::new(),
                        buckets: Memo::new(),
                        identities: Memo::new(),
                        secrets: Memo::new(),
                        registries: Memo::new(),
                        group_refs: Memo::new(),
                        done: Memo::new(),
                    };
                    graphs.insert((dataset.name.clone(), *cloud), Arc::new(graph));
                }
            }
            GraphSet { graphs, groups }
        })
    }

    pub fn graph(&self, dataset: &str, cloud: CloudName) -> Result<Arc<DatasetCloudGraph>> {
        self.graphs
            .get(&(dataset.to_string(), cloud))
            .cloned()
            .ok_or_else(|| InfraError::DatasetNotFound(format!("{dataset} on {cloud}")))
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Arc<DatasetCloudGraph>> {
        self.graphs.values()
    }

    pub fn for_dataset<'a>(
        &'a self,
        dataset: &'a str,
    ) -> impl Iterator<Item = &'a Arc<DatasetCloudGraph>> + 'a {
        self.graphs
            .iter()
            .filter(move |((name, _), _)| name == dataset)
            .map(|(_, g)| g)
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }
}

// ---------------------------------------------------------------------------
// DatasetCloudGraph
// ---------------------------------------------------------------------------

/// A component setup that failed during [`DatasetCloudGraph::build`].
#[derive(Debug)]
pub struct ComponentFailure {
    pub component: Component,
    pub error: InfraError,
}

pub struct DatasetCloudGraph {
    dataset: Arc<DatasetConfig>,
    org: Arc<OrgConfig>,
    infra: Arc<dyn CloudInfra>,
    groups: Arc<GroupRegistry>,
    set: Weak<GraphSet>,
    projects: Memo<ProjectHandle>,
    buckets: Memo<BucketHandle>,
    identities: Memo<IdentityHandle>,
    secrets: Memo<SecretHandle>,
    registries: Memo<RegistryHandle>,
    group_refs: Memo<GroupRef>,
    done: Memo<()>,
}

impl DatasetCloudGraph {
    pub fn name(&self) -> &str {
        &self.dataset.name
    }

    pub fn cloud(&self) -> CloudName {
        self.infra.name()
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.dataset
    }

    pub fn infra(&self) -> &Arc<dyn CloudInfra> {
        &self.infra
    }

    pub fn group_registry(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    fn key(&self, resource: &str) -> String {
        naming::resource_key(&self.dataset.name, self.cloud(), resource)
    }

    /// The graph of another dataset on the same cloud.
    pub fn other(&self, dataset: &str) -> Result<Arc<DatasetCloudGraph>> {
        let set = self.set.upgrade().ok_or_else(|| InfraError::Provisioning {
            resource_key: self.key("graph"),
            message: "graph set is no longer alive".to_string(),
        })?;
        set.graph(dataset, self.cloud())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub fn project(&self) -> Result<ProjectHandle> {
        let key = self.key("project");
        self.projects.get_or_init(&key, || {
            self.infra.create_project(&key, self.dataset.project_id())
        })
    }

    /// Separate project billed against the shared budget, if enabled.
    pub fn shared_project(&self) -> Result<Option<ProjectHandle>> {
        if !self.dataset.enable_shared_project {
            return Ok(None);
        }
        let key = self.key("shared-project");
        let name = format!("{}-shared", self.dataset.project_id());
        self.projects
            .get_or_init(&key, || self.infra.create_project(&key, &name))
            .map(Some)
    }

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------

    fn bucket(
        &self,
        suffix: &str,
        rules: impl FnOnce(&dyn CloudInfra) -> Vec<LifecycleRule>,
        options: BucketOptions,
    ) -> Result<BucketHandle> {
        let key = self.key(&format!("bucket-{suffix}"));
        self.keyed_bucket(key, suffix, rules, options)
    }

    /// Buckets named by the dataset config live in their own key space so a
    /// configured name can never shadow a built-in bucket.
    fn extra_bucket(&self, name: &str, options: BucketOptions) -> Result<BucketHandle> {
        let key = self.key(&format!("bucket-extra-{name}"));
        self.keyed_bucket(key, name, Self::undelete, options)
    }

    fn keyed_bucket(
        &self,
        key: String,
        suffix: &str,
        rules: impl FnOnce(&dyn CloudInfra) -> Vec<LifecycleRule>,
        options: BucketOptions,
    ) -> Result<BucketHandle> {
        self.buckets.get_or_init(&key, || {
            let project = self.project()?;
            let name = naming::bucket_name(
                self.org.storage_prefix(self.cloud()),
                &self.dataset.name,
                suffix,
                options.unique,
            );
            self.infra
                .create_bucket(&key, &name, &project, rules(self.infra.as_ref()), &options)
        })
    }

    fn options(&self, versioning: bool) -> BucketOptions {
        BucketOptions {
            autoclass: self.dataset.autoclass,
            versioning,
            ..BucketOptions::default()
        }
    }

    fn undelete(infra: &dyn CloudInfra) -> Vec<LifecycleRule> {
        vec![infra.bucket_rule_undelete(naming::UNDELETE_DAYS)]
    }

    fn temporary(infra: &dyn CloudInfra) -> Vec<LifecycleRule> {
        vec![infra.bucket_rule_temporary(naming::TMP_DAYS)]
    }

    pub fn main_bucket(&self) -> Result<BucketHandle> {
        self.bucket("main", Self::undelete, self.options(true))
    }

    pub fn main_tmp_bucket(&self) -> Result<BucketHandle> {
        self.bucket("main-tmp", Self::temporary, self.options(false))
    }

    pub fn main_analysis_bucket(&self) -> Result<BucketHandle> {
        self.bucket("main-analysis", Self::undelete, self.options(true))
    }

    pub fn main_web_bucket(&self) -> Result<BucketHandle> {
        self.bucket("main-web", Self::undelete, self.options(true))
    }

    /// The dataset's own upload bucket followed by any additional ones,
    /// which keep their configured names.
    pub fn main_upload_buckets(&self) -> Result<Vec<BucketHandle>> {
        let mut buckets = vec![self.bucket("main-upload", Self::undelete, self.options(true))?];
        for name in &self.dataset.additional_upload_buckets {
            let options = BucketOptions {
                unique: true,
                ..self.options(true)
            };
            buckets.push(self.extra_bucket(name, options)?);
        }
        Ok(buckets)
    }

    pub fn test_bucket(&self) -> Result<BucketHandle> {
        self.bucket("test", Self::undelete, self.options(true))
    }

    pub fn test_tmp_bucket(&self) -> Result<BucketHandle> {
        self.bucket("test-tmp", Self::temporary, self.options(false))
    }

    pub fn test_analysis_bucket(&self) -> Result<BucketHandle> {
        self.bucket("test-analysis", Self::undelete, self.options(true))
    }

    pub fn test_web_bucket(&self) -> Result<BucketHandle> {
        self.bucket("test-web", Self::undelete, self.options(true))
    }

    pub fn test_upload_bucket(&self) -> Result<BucketHandle> {
        self.bucket("test-upload", Self::undelete, self.options(true))
    }

    pub fn archive_bucket(&self) -> Result<BucketHandle> {
        let days = u32::try_from(self.dataset.archive_age).map_err(|_| {
            InfraError::Provisioning {
                resource_key: self.key("bucket-archive"),
                message: format!("archive_age {} is out of range", self.dataset.archive_age),
            }
        })?;
        // autoclass would fight the explicit tier transition
        let options = BucketOptions {
            autoclass: false,
            ..self.options(false)
        };
        self.bucket(
            "archive",
            |infra| vec![infra.bucket_rule_archive(days)],
            options,
        )
    }

    pub fn release_bucket(&self) -> Result<Option<BucketHandle>> {
        if !self.dataset.enable_release {
            return Ok(None);
        }
        let options = BucketOptions {
            requester_pays: true,
            ..self.options(true)
        };
        self.bucket("release-requester-pays", Self::undelete, options)
            .map(Some)
    }

    pub fn hail_bucket(&self) -> Result<BucketHandle> {
        self.bucket("hail", Self::temporary, self.options(false))
    }

    /// Buckets holding data of one sensitivity tier.
    pub fn tier_buckets(&self, level: AccessLevel) -> Result<Vec<BucketHandle>> {
        match level {
            AccessLevel::Test => Ok(vec![
                self.test_bucket()?,
                self.test_tmp_bucket()?,
                self.test_analysis_bucket()?,
                self.test_web_bucket()?,
                self.test_upload_bucket()?,
            ]),
            AccessLevel::Standard => {
                let mut buckets = vec![
                    self.main_bucket()?,
                    self.main_tmp_bucket()?,
                    self.main_analysis_bucket()?,
                    self.main_web_bucket()?,
                ];
                buckets.extend(self.main_upload_buckets()?);
                Ok(buckets)
            }
            AccessLevel::Full => Ok(vec![self.archive_bucket()?]),
        }
    }

    // -----------------------------------------------------------------------
    // Registry and secrets
    // -----------------------------------------------------------------------

    pub fn container_registry(&self) -> Result<RegistryHandle> {
        let key = self.key("registry");
        self.registries.get_or_init(&key, || {
            let project = self.project()?;
            self.infra
                .create_registry(&key, &self.dataset.name, &project)
        })
    }

    pub fn access_cache_secret(&self) -> Result<SecretHandle> {
        let key = self.key("secret-access-members-cache");
        self.secrets.get_or_init(&key, || {
            let project = self.project()?;
            let name = format!("{}-access-members-cache", self.dataset.name);
            self.infra.create_secret(&key, &name, None, &project)
        })
    }

    /// Holds the credentials cromwell uses to act as its account at `level`.
    /// Key material is added out of band.
    pub fn cromwell_secret(&self, level: AccessLevel) -> Result<SecretHandle> {
        let key = self.key(&format!("secret-cromwell-{level}"));
        self.secrets.get_or_init(&key, || {
            let project = self.project()?;
            let name = format!("{}-cromwell-{level}-credentials", self.dataset.name);
            self.infra.create_secret(&key, &name, None, &project)
        })
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// The dataset's group of `kind`. First use registers a placeholder and
    /// nests it into the groups it belongs to.
    pub fn group(&self, kind: GroupKind) -> Result<GroupRef> {
        let key = self.key(&format!("group-{kind}"));
        self.group_refs.get_or_init(&key, || {
            let group = naming::group_ref(&self.org, self.cloud(), &self.dataset.name, kind);
            self.groups.placeholder(&group)?;
            for parent in kind.nested_into() {
                let parent = self.group(*parent)?;
                self.groups
                    .add_member(&parent, Principal::Group(group.clone()))?;
            }
            Ok(group)
        })
    }

    pub fn access_group(&self) -> Result<GroupRef> {
        self.group(GroupKind::Access)
    }

    pub fn access_level_group(&self, level: AccessLevel) -> Result<GroupRef> {
        self.group(GroupKind::Level(level))
    }

    pub fn reader_group(&self, level: AccessLevel) -> Result<GroupRef> {
        self.group(GroupKind::Reader(level))
    }

    pub fn sample_metadata_group(&self, permission: MetadataPermission) -> Result<GroupRef> {
        self.group(GroupKind::SampleMetadata(permission))
    }

    pub fn add_member(&self, kind: GroupKind, member: Principal) -> Result<bool> {
        let group = self.group(kind)?;
        self.groups.add_member(&group, member)
    }

    // -----------------------------------------------------------------------
    // Identities
    // -----------------------------------------------------------------------

    /// The batch identity for `level`, which must already exist.
    pub fn hail_account(&self, level: AccessLevel) -> Result<IdentityHandle> {
        let key = self.key(&format!("hail-{level}"));
        self.identities.get_or_init(&key, || {
            let account = self
                .dataset
                .cloud(self.cloud())
                .hail_accounts
                .get(&level)
                .ok_or_else(|| {
                    InfraError::MissingIdentity(format!(
                        "{} hail account ({level}) on {}",
                        self.dataset.name,
                        self.cloud()
                    ))
                })?;
            Ok(IdentityHandle::existing(
                self.cloud(),
                naming::external_account_key(&self.dataset.name, self.cloud(), &account.cloud_id),
                account.cloud_id.clone(),
            ))
        })
    }

    /// Deployment identity for `level`: the configured one, or a new one.
    pub fn deployment_account(&self, level: AccessLevel) -> Result<IdentityHandle> {
        let key = self.key(&format!("deploy-{level}"));
        self.identities.get_or_init(&key, || {
            if let Some(id) = self
                .dataset
                .cloud(self.cloud())
                .deployment_accounts
                .get(&level)
            {
                return Ok(IdentityHandle::existing(self.cloud(), key.clone(), id.clone()));
            }
            let project = self.project()?;
            self.infra
                .create_service_account(&key, &format!("deploy-{level}"), &project)
        })
    }

    pub fn main_upload_account(&self) -> Result<IdentityHandle> {
        let key = self.key("main-upload-account");
        self.identities.get_or_init(&key, || {
            let project = self.project()?;
            self.infra
                .create_service_account(&key, "main-upload", &project)
        })
    }

    pub fn notebook_account(&self) -> Result<IdentityHandle> {
        let key = self.key("notebook-account");
        self.identities.get_or_init(&key, || {
            let project = self.project()?;
            self.infra.create_service_account(
                &key,
                &format!("notebook-{}", self.dataset.name),
                &project,
            )
        })
    }

    fn level_account(&self, prefix: &str, level: AccessLevel) -> Result<IdentityHandle> {
        let key = self.key(&format!("{prefix}-{level}"));
        self.identities.get_or_init(&key, || {
            let project = self.project()?;
            self.infra
                .create_service_account(&key, &format!("{prefix}-{level}"), &project)
        })
    }

    /// Identity cromwell runs workflows as at `level`.
    pub fn cromwell_account(&self, level: AccessLevel) -> Result<IdentityHandle> {
        self.level_account("cromwell", level)
    }

    /// Identity of dataproc cluster workers at `level`.
    pub fn dataproc_account(&self, level: AccessLevel) -> Result<IdentityHandle> {
        self.level_account("dataproc", level)
    }

    // -----------------------------------------------------------------------
    // Grants
    // -----------------------------------------------------------------------

    pub fn grant(&self, principal: &Principal, resource: ResourceRef, role: Role) -> Result<bool> {
        let key = self.key(&naming::external_sa_name(&format!(
            "grant-{resource}-{}-{role}",
            principal.id()
        )));
        let binding = RoleBinding::new(principal.clone(), resource, role);
        self.infra.grant_role(&key, &binding)
    }

    fn grant_buckets(
        &self,
        group: &GroupRef,
        buckets: &[BucketHandle],
        permission: BucketPermission,
    ) -> Result<()> {
        let principal = Principal::Group(group.clone());
        for bucket in buckets {
            self.grant(&principal, bucket.resource(), Role::Bucket(permission))?;
        }
        Ok(())
    }

    /// Apply one dependency binding whose grantee belongs to this dataset.
    pub fn apply(&self, binding: &RoleBinding) -> Result<()> {
        match &binding.resource {
            ResourceRef::AccessTier { dataset, level } => {
                let readers = self.other(dataset)?.reader_group(*level)?;
                self.groups.add_member(&readers, binding.principal.clone())?;
            }
            ResourceRef::Registry { name } => {
                let registry = self.other(name)?.container_registry()?;
                self.grant(&binding.principal, registry.resource(), binding.role.clone())?;
            }
            ResourceRef::BatchBillingProject { .. } => {
                self.add_member(GroupKind::InternalOperators, binding.principal.clone())?;
            }
            ResourceRef::Project { .. } => {
                let project = self.project()?;
                self.grant(&binding.principal, project.resource(), binding.role.clone())?;
            }
            other => {
                self.grant(&binding.principal, other.clone(), binding.role.clone())?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    /// Set up every enabled component. A failing component does not stop the
    /// others.
    pub fn build(&self) -> Vec<ComponentFailure> {
        let mut failures = Vec::new();
        for component in self.dataset.components_for(self.cloud()) {
            let outcome = match component {
                Component::Storage => self.setup_storage(),
                Component::HailAccounts => self.setup_hail_accounts(),
                Component::ContainerRegistry => self.setup_container_registry(),
                Component::AnalysisRunner => self.setup_analysis_runner(),
                Component::Notebooks => self.setup_notebooks(),
                Component::Budget => self.setup_budget(),
                Component::Spark => self.setup_spark(),
                Component::Cromwell => self.setup_cromwell(),
                Component::SampleMetadata => self.setup_sample_metadata(),
            };
            if let Err(error) = outcome {
                tracing::warn!(
                    dataset = %self.dataset.name,
                    cloud = %self.cloud(),
                    component = %component,
                    "component setup failed: {error}"
                );
                failures.push(ComponentFailure { component, error });
            }
        }
        failures
    }

    fn setup_storage(&self) -> Result<()> {
        let levels = self.dataset.access_levels();
        let test = if self.dataset.setup_test {
            self.tier_buckets(AccessLevel::Test)?
        } else {
            Vec::new()
        };
        let main = vec![self.main_bucket()?];
        let web = vec![self.main_web_bucket()?];
        let scratch = vec![
            self.main_tmp_bucket()?,
            self.main_analysis_bucket()?,
            self.main_web_bucket()?,
        ];
        let uploads = self.main_upload_buckets()?;
        let archive = vec![self.archive_bucket()?];

        for level in &levels {
            let group = self.access_level_group(*level)?;
            self.grant_buckets(&group, &test, BucketPermission::Mutate)?;
            match level {
                AccessLevel::Test => {}
                AccessLevel::Standard => {
                    self.grant_buckets(&group, &scratch, BucketPermission::Mutate)?;
                    self.grant_buckets(&group, &main, BucketPermission::Read)?;
                    self.grant_buckets(&group, &uploads, BucketPermission::Read)?;
                }
                AccessLevel::Full => {
                    self.grant_buckets(&group, &scratch, BucketPermission::Mutate)?;
                    self.grant_buckets(&group, &main, BucketPermission::Mutate)?;
                    self.grant_buckets(&group, &uploads, BucketPermission::Mutate)?;
                    self.grant_buckets(&group, &archive, BucketPermission::Mutate)?;
                }
            }
        }

        // readers from other datasets
        for level in &levels {
            let readers = self.reader_group(*level)?;
            self.grant_buckets(&readers, &self.tier_buckets(*level)?, BucketPermission::Read)?;
        }

        let access = self.access_group()?;
        self.grant_buckets(&access, &main, BucketPermission::List)?;

        let analysis = self.group(GroupKind::Analysis)?;
        self.grant_buckets(&analysis, &test, BucketPermission::Mutate)?;
        self.grant_buckets(&analysis, &main, BucketPermission::Read)?;
        self.grant_buckets(&analysis, &scratch, BucketPermission::Mutate)?;

        let web_access = self.group(GroupKind::WebAccess)?;
        self.grant_buckets(&web_access, &web, BucketPermission::Read)?;

        let upload = self.group(GroupKind::Upload)?;
        self.grant_buckets(&upload, &uploads, BucketPermission::Append)?;
        let uploader = self.main_upload_account()?.principal();
        for bucket in &uploads {
            self.grant(&uploader, bucket.resource(), Role::Bucket(BucketPermission::Mutate))?;
        }

        let data_manager = self.group(GroupKind::DataManager)?;
        self.grant_buckets(&data_manager, &main, BucketPermission::Mutate)?;
        self.grant_buckets(&data_manager, &uploads, BucketPermission::Mutate)?;
        self.grant_buckets(&data_manager, &archive, BucketPermission::Read)?;

        if let Some(release) = self.release_bucket()? {
            let release = vec![release];
            let release_access = self.group(GroupKind::ReleaseAccess)?;
            self.grant_buckets(&release_access, &release, BucketPermission::Read)?;
            self.grant_buckets(&data_manager, &release, BucketPermission::Mutate)?;
        }
        Ok(())
    }

    fn setup_hail_accounts(&self) -> Result<()> {
        let bucket = vec![self.hail_bucket()?];
        for level in self.dataset.access_levels() {
            let account = self.hail_account(level)?;
            let group = self.access_level_group(level)?;
            self.groups.add_member(&group, account.principal())?;
            self.grant_buckets(&group, &bucket, BucketPermission::Mutate)?;
        }
        Ok(())
    }

    fn setup_container_registry(&self) -> Result<()> {
        let is_common = self.dataset.name == self.org.common_dataset;
        if !is_common && !self.dataset.create_container_registry {
            return Ok(());
        }
        let registry = self.container_registry()?;
        for level in self.dataset.access_levels() {
            let membership = match level {
                AccessLevel::Test => RegistryMembership::Reader,
                AccessLevel::Standard | AccessLevel::Full => RegistryMembership::Writer,
            };
            let group = Principal::Group(self.access_level_group(level)?);
            self.grant(&group, registry.resource(), Role::Registry(membership))?;
        }
        let analysis = Principal::Group(self.group(GroupKind::Analysis)?);
        self.grant(
            &analysis,
            registry.resource(),
            Role::Registry(RegistryMembership::Reader),
        )?;
        Ok(())
    }

    fn setup_analysis_runner(&self) -> Result<()> {
        let access = Principal::Group(self.access_group()?);
        self.grant(
            &access,
            ResourceRef::CloudRunService {
                name: "analysis-runner".to_string(),
            },
            Role::CloudRunInvoker,
        )?;

        let secret = self.access_cache_secret()?;
        let services = &self.org.service_accounts;
        if let Some(runner) = &services.analysis_runner {
            let runner = Principal::service_account(runner.clone());
            self.grant(&runner, secret.resource(), Role::Secret(SecretMembership::Accessor))?;
            for level in self.dataset.access_levels() {
                let account = self.deployment_account(level)?;
                self.grant(&runner, account.resource(), Role::ServiceAccountUser)?;
            }
        }
        if let Some(cache) = &services.access_group_cache {
            let cache = Principal::service_account(cache.clone());
            self.grant(&cache, secret.resource(), Role::Secret(SecretMembership::Admin))?;
        }
        Ok(())
    }

    fn setup_notebooks(&self) -> Result<()> {
        let account = self.notebook_account()?;
        let analysis = Principal::Group(self.group(GroupKind::Analysis)?);
        self.grant(&analysis, account.resource(), Role::ServiceAccountUser)?;
        Ok(())
    }

    fn hail_enabled(&self) -> bool {
        self.dataset
            .has_component(self.cloud(), Component::HailAccounts)
    }

    fn setup_spark(&self) -> Result<()> {
        // dataproc roles only exist on GCP
        let project = match self.cloud() {
            CloudName::Gcp => Some(self.project()?),
            CloudName::Azure => None,
        };
        for level in self.dataset.access_levels() {
            let dataproc = self.dataproc_account(level)?;
            if let Some(project) = &project {
                self.grant(&dataproc.principal(), project.resource(), Role::DataprocWorker)?;
            }
            if !self.hail_enabled() {
                continue;
            }
            let hail = self.hail_account(level)?.principal();
            self.grant(&hail, dataproc.resource(), Role::ServiceAccountUser)?;
            if let Some(project) = &project {
                self.grant(&hail, project.resource(), Role::DataprocAdmin)?;
                self.grant(&hail, project.resource(), Role::DataprocWorker)?;
            }
        }
        Ok(())
    }

    fn setup_cromwell(&self) -> Result<()> {
        let services = &self.org.service_accounts;
        let runner = services.cromwell_runner.clone().map(Principal::service_account);
        let analysis_runner = services.analysis_runner.clone().map(Principal::service_account);
        let project = match self.cloud() {
            CloudName::Gcp => Some(self.project()?),
            CloudName::Azure => None,
        };

        for level in self.dataset.access_levels() {
            let account = self.cromwell_account(level)?;
            self.grant(&account.principal(), account.resource(), Role::ServiceAccountUser)?;
            if let Some(runner) = &runner {
                self.grant(runner, account.resource(), Role::ServiceAccountUser)?;
            }

            let secret = self.cromwell_secret(level)?;
            let accessor = Role::Secret(SecretMembership::Accessor);
            if let Some(analysis_runner) = &analysis_runner {
                self.grant(analysis_runner, secret.resource(), accessor.clone())?;
            }
            if self.hail_enabled() {
                let hail = self.hail_account(level)?.principal();
                self.grant(&hail, secret.resource(), accessor)?;
            }

            if let Some(project) = &project {
                self.grant(&account.principal(), project.resource(), Role::WorkflowsRunner)?;
            }
        }
        Ok(())
    }

    fn setup_sample_metadata(&self) -> Result<()> {
        if !self.dataset.enable_metamist_project {
            tracing::debug!(dataset = %self.dataset.name, "metadata project disabled");
            return Ok(());
        }
        let service = ResourceRef::CloudRunService {
            name: "sample-metadata".to_string(),
        };
        let access = Principal::Group(self.access_group()?);
        // fails first on clouds without a cloud-run equivalent
        self.grant(&access, service.clone(), Role::CloudRunInvoker)?;

        use MetadataPermission::{MainRead, MainWrite, TestRead, TestWrite};
        for permission in [MainRead, TestRead, TestWrite] {
            self.add_member(GroupKind::SampleMetadata(permission), access.clone())?;
        }
        for level in self.dataset.access_levels() {
            let group = Principal::Group(self.access_level_group(level)?);
            for permission in MetadataPermission::for_level(level) {
                self.add_member(GroupKind::SampleMetadata(*permission), group.clone())?;
            }
        }
        if let Some(logger) = &self.org.service_accounts.analysis_runner_logger {
            let logger = Principal::service_account(logger.clone());
            for permission in MetadataPermission::all() {
                self.add_member(GroupKind::SampleMetadata(*permission), logger.clone())?;
            }
        }
        for sa in &self.dataset.sm_read_only_sas {
            self.add_member(GroupKind::SampleMetadata(MainRead), Principal::service_account(sa))?;
        }
        for sa in &self.dataset.sm_read_write_sas {
            for permission in [MainRead, MainWrite] {
                self.add_member(
                    GroupKind::SampleMetadata(permission),
                    Principal::service_account(sa),
                )?;
            }
        }

        for permission in MetadataPermission::all() {
            let group = Principal::Group(self.sample_metadata_group(*permission)?);
            self.grant(&group, service.clone(), Role::CloudRunInvoker)?;
        }
        Ok(())
    }

    fn setup_budget(&self) -> Result<()> {
        let Some(budget) = self.dataset.budgets.get(&self.cloud()) else {
            tracing::debug!(dataset = %self.dataset.name, "no budget configured");
            return Ok(());
        };
        let currency = budget
            .currency
            .clone()
            .unwrap_or_else(|| self.org.budget_currency.clone());

        let key = self.key("budget");
        self.done.get_or_init(&key, || {
            let project = self.project()?;
            self.infra
                .create_budget(&key, &project, budget.monthly_budget, &currency)
        })?;

        if let (Some(total), Some(shared)) = (budget.shared_total_budget, self.shared_project()?) {
            let key = self.key("shared-budget");
            self.done.get_or_init(&key, || {
                self.infra.create_budget(&key, &shared, total, &currency)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::azure::AzureInfra;
    use crate::cloud::gcp::GcpInfra;
    use crate::cloud::{BindingLedger, ProvisionRequest, RecordingProvisioner};
    use crate::testutil;

    fn grants_of(rec: &RecordingProvisioner, member: &str, role: &str) -> usize {
        rec.count_where(|c| {
            matches!(&c.request, ProvisionRequest::RoleGrant { member: m, role: r, .. }
                if m == member && r == role)
        })
    }

    fn graphs(
        config: &ValidatedConfig,
        rec: Arc<RecordingProvisioner>,
    ) -> (Arc<GraphSet>, Arc<GroupRegistry>) {
        let gcp = GcpInfra::new(&config.org, rec, Arc::new(BindingLedger::default())).unwrap();
        let mut infras: BTreeMap<CloudName, Arc<dyn CloudInfra>> = BTreeMap::new();
        infras.insert(CloudName::Gcp, Arc::new(gcp));
        let groups = Arc::new(GroupRegistry::new());
        (GraphSet::build(config, &infras, groups.clone()), groups)
    }

    #[test]
    fn repeated_calls_return_the_cached_handle() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let fg = set.graph("fewgenomes", CloudName::Gcp).unwrap();

        let first = fg.main_bucket().unwrap();
        for _ in 0..5 {
            assert_eq!(fg.main_bucket().unwrap(), first);
        }
        assert_eq!(first.name, "cpg-fewgenomes-main");
        assert_eq!(rec.count("bucket"), 1);
        assert_eq!(rec.count("project"), 1);
    }

    #[test]
    fn upload_buckets_named_like_built_ins_get_their_own_handle() {
        let config = testutil::config_with_dataset(
            "  - name: extra\n    additional_upload_buckets: [main, archive]\n",
        );
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let extra = set.graph("extra", CloudName::Gcp).unwrap();

        let main = extra.main_bucket().unwrap();
        let uploads = extra.main_upload_buckets().unwrap();
        let archive = extra.archive_bucket().unwrap();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[1].name, "main");
        assert_eq!(uploads[1].key, "extra-gcp-bucket-extra-main");
        assert_eq!(uploads[2].name, "archive");
        assert_eq!(main.name, "cpg-extra-main");
        assert_eq!(archive.name, "cpg-extra-archive");
        // main, main-upload, two extras, archive
        assert_eq!(rec.count("bucket"), 5);
    }

    #[test]
    fn unused_accessors_create_nothing() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        assert_eq!(set.graphs().count(), 3);
        assert!(rec.calls().is_empty());
        assert!(groups.seal().unwrap().is_empty());
    }

    #[test]
    fn concurrent_first_calls_provision_once() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let fg = set.graph("fewgenomes", CloudName::Gcp).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let fg = &fg;
                s.spawn(move || fg.main_tmp_bucket().unwrap());
            }
        });
        assert_eq!(rec.count("bucket"), 1);
        assert_eq!(rec.count("project"), 1);
    }

    #[test]
    fn failures_are_cached_and_propagate_to_dependents() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new().failing_when(|c| {
            matches!(c.request, crate::cloud::ProvisionRequest::Project { .. })
        }));
        let (set, _) = graphs(&config, rec.clone());
        let fg = set.graph("fewgenomes", CloudName::Gcp).unwrap();

        let err = fg.main_bucket().unwrap_err();
        assert!(matches!(
            err,
            InfraError::Provisioning { ref resource_key, .. } if resource_key == "fewgenomes-gcp-project"
        ));
        assert!(fg.main_bucket().is_err());
        assert!(fg.test_bucket().is_err());
        assert_eq!(rec.count("project"), 1);
        assert_eq!(rec.count("bucket"), 0);

        // other datasets are independent
        let tg = set.graph("thousand-genomes", CloudName::Gcp).unwrap();
        assert!(tg.main_bucket().is_err());
        assert_eq!(rec.count("project"), 2);
    }

    #[test]
    fn re_entrant_accessors_fail_fast() {
        let memo: Memo<u32> = Memo::new();
        let err = memo
            .get_or_init("outer", || memo.get_or_init("outer", || Ok(1)))
            .unwrap_err();
        // the inner call is refused, the outer call caches that failure
        assert!(matches!(err, InfraError::AccessorCycle { ref key } if key == "outer"));
        assert_eq!(memo.resolved(), 1);
    }

    #[test]
    fn accessor_cycles_across_threads_fail_instead_of_blocking() {
        let memo: Memo<u32> = Memo::new();
        let both_started = std::sync::Barrier::new(2);
        let (left, right) = std::thread::scope(|s| {
            let left = s.spawn(|| {
                memo.get_or_init("left", || {
                    both_started.wait();
                    memo.get_or_init("right", || Ok(1))
                })
            });
            let right = s.spawn(|| {
                memo.get_or_init("right", || {
                    both_started.wait();
                    memo.get_or_init("left", || Ok(2))
                })
            });
            (left.join().unwrap(), right.join().unwrap())
        });
        assert!(matches!(left, Err(InfraError::AccessorCycle { .. })));
        assert!(matches!(right, Err(InfraError::AccessorCycle { .. })));
        assert_eq!(memo.resolved(), 2);
    }

    #[test]
    fn groups_nest_on_first_use() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        let fg = set.graph("fewgenomes", CloudName::Gcp).unwrap();
        let dm = fg.group(GroupKind::DataManager).unwrap();
        assert_eq!(dm.address, "fewgenomes-data-manager@example.org");
        fg.add_member(GroupKind::DataManager, Principal::user("dm@example.org"))
            .unwrap();

        let snap = groups.seal().unwrap();
        // data-manager, analysis, metadata-access, web-access, upload, access
        assert_eq!(snap.len(), 6);
        let access = snap
            .of_kind(CloudName::Gcp, "fewgenomes", GroupKind::Access)
            .unwrap();
        assert!(access.flattened.contains(&Principal::user("dm@example.org")));
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn storage_component_grants_tiers() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let tg = set.graph("thousand-genomes", CloudName::Gcp).unwrap();
        tg.setup_storage().unwrap();
        // 5 test + 4 main + 1 upload + 1 archive
        assert_eq!(rec.count("bucket"), 11);
        let archive = rec.count_where(|c| c.key == "thousand-genomes-gcp-bucket-archive");
        assert_eq!(archive, 1);
        assert!(rec.count("role_grant") > 0);
    }

    #[test]
    fn missing_hail_accounts_fail_only_their_component() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let tg = set.graph("thousand-genomes", CloudName::Gcp).unwrap();
        let failures = tg.build();
        let failed: Vec<Component> = failures.iter().map(|f| f.component).collect();
        assert_eq!(failed, vec![Component::HailAccounts]);
        assert!(matches!(failures[0].error, InfraError::MissingIdentity(_)));
        assert_eq!(rec.count("budget"), 1);
        assert_eq!(rec.count("registry"), 0);
    }

    #[test]
    fn configured_identities_are_not_created() {
        let config = testutil::config_with_dataset(&testutil::hailed_dataset("hail-accounts"));
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        let graph = set.graph("hailed", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());
        assert_eq!(rec.count("service_account"), 0);
        assert_eq!(rec.count("bucket"), 1);

        let snap = groups.seal().unwrap();
        let test = snap
            .of_kind(CloudName::Gcp, "hailed", GroupKind::Level(AccessLevel::Test))
            .unwrap();
        assert!(test.direct.contains(&Principal::service_account(
            "hailed-test@hail.iam.gserviceaccount.com"
        )));
    }

    #[test]
    fn tier_bindings_nest_into_reader_groups() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        let tg = set.graph("thousand-genomes", CloudName::Gcp).unwrap();
        for binding in crate::deps::resolve(&config, CloudName::Gcp) {
            let grantee = binding.principal.as_group().map(|g| g.dataset.clone());
            if grantee.as_deref() == Some("thousand-genomes")
                && matches!(binding.resource, ResourceRef::AccessTier { .. })
            {
                tg.apply(&binding).unwrap();
            }
        }
        let snap = groups.seal().unwrap();
        let test_readers = snap
            .of_kind(CloudName::Gcp, "fewgenomes", GroupKind::Reader(AccessLevel::Test))
            .unwrap();
        assert_eq!(test_readers.direct.len(), 3);
        let full_readers = snap
            .of_kind(CloudName::Gcp, "fewgenomes", GroupKind::Reader(AccessLevel::Full))
            .unwrap();
        assert_eq!(full_readers.direct.len(), 1);
        // nothing provisioned: the reader groups only exist logically so far
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn cromwell_gets_an_account_and_credentials_per_level() {
        let config = testutil::config_with_dataset(&testutil::hailed_dataset(
            "hail-accounts, cromwell",
        ));
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let graph = set.graph("hailed", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());

        assert_eq!(rec.count("service_account"), 3);
        assert_eq!(rec.count("secret"), 3);
        let account = graph.cromwell_account(AccessLevel::Test).unwrap();
        assert_eq!(account.id, "cromwell-test@hailed.iam.gserviceaccount.com");

        let sa_user = "roles/iam.serviceAccountUser";
        let runner = "serviceAccount:cromwell-runner@analysis.iam.gserviceaccount.com";
        assert_eq!(grants_of(&rec, runner, sa_user), 3);
        assert_eq!(grants_of(&rec, &account.principal().member_key(), sa_user), 1);

        let accessor = "roles/secretmanager.secretAccessor";
        let hail = "serviceAccount:hailed-test@hail.iam.gserviceaccount.com";
        assert_eq!(grants_of(&rec, hail, accessor), 1);
        let analysis_runner = "serviceAccount:analysis-runner@analysis.iam.gserviceaccount.com";
        assert_eq!(grants_of(&rec, analysis_runner, accessor), 3);
        assert_eq!(
            rec.count_where(|c| matches!(&c.request, ProvisionRequest::RoleGrant { role, .. }
                if role == "roles/lifesciences.workflowsRunner")),
            3
        );
    }

    #[test]
    fn spark_lets_hail_accounts_drive_dataproc() {
        let config =
            testutil::config_with_dataset(&testutil::hailed_dataset("hail-accounts, spark"));
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let graph = set.graph("hailed", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());

        assert_eq!(rec.count("service_account"), 3);
        let dataproc = graph.dataproc_account(AccessLevel::Full).unwrap();
        assert_eq!(dataproc.id, "dataproc-full@hailed.iam.gserviceaccount.com");
        let hail = "serviceAccount:hailed-full@hail.iam.gserviceaccount.com";
        assert_eq!(grants_of(&rec, hail, "roles/iam.serviceAccountUser"), 1);
        assert_eq!(grants_of(&rec, hail, "roles/dataproc.admin"), 1);
        assert_eq!(grants_of(&rec, hail, "roles/dataproc.worker"), 1);
        assert_eq!(
            grants_of(&rec, &dataproc.principal().member_key(), "roles/dataproc.worker"),
            1
        );
    }

    #[test]
    fn spark_without_hail_accounts_only_sets_up_workers() {
        let config = testutil::config_with_dataset(
            "  - name: sparky\n    components: { gcp: [spark] }\n",
        );
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, _) = graphs(&config, rec.clone());
        let graph = set.graph("sparky", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());
        assert_eq!(rec.count("service_account"), 3);
        assert_eq!(rec.count("role_grant"), 3);
    }

    #[test]
    fn sample_metadata_groups_follow_access_levels() {
        let config = testutil::config_with_dataset(
            "  - name: meta\n    components: { gcp: [sample-metadata] }\n    sm_read_only_sas: [reader@x.iam.gserviceaccount.com]\n    sm_read_write_sas: [writer@x.iam.gserviceaccount.com]\n",
        );
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        let graph = set.graph("meta", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());
        // access plus four metadata groups may invoke the service
        assert_eq!(rec.count("role_grant"), 5);

        let snap = groups.seal().unwrap();
        let group = |permission| {
            snap.of_kind(CloudName::Gcp, "meta", GroupKind::SampleMetadata(permission))
                .unwrap()
        };
        let nests = |permission, kind| {
            group(permission)
                .direct
                .iter()
                .any(|p| p.as_group().is_some_and(|g| g.kind == kind))
        };
        let reader = Principal::service_account("reader@x.iam.gserviceaccount.com");
        let writer = Principal::service_account("writer@x.iam.gserviceaccount.com");
        let logger = Principal::service_account("runner-logger@analysis.iam.gserviceaccount.com");

        let main_read = group(MetadataPermission::MainRead);
        assert_eq!(main_read.group.name, "meta-sample-metadata-main-read");
        assert!(main_read.direct.contains(&reader));
        assert!(main_read.direct.contains(&writer));
        assert!(nests(MetadataPermission::MainRead, GroupKind::Access));

        let main_write = group(MetadataPermission::MainWrite);
        assert!(main_write.direct.contains(&writer));
        assert!(!main_write.direct.contains(&reader));
        assert!(!nests(MetadataPermission::MainWrite, GroupKind::Access));
        assert!(nests(MetadataPermission::MainWrite, GroupKind::Level(AccessLevel::Standard)));
        assert!(!nests(MetadataPermission::MainWrite, GroupKind::Level(AccessLevel::Test)));

        assert!(nests(MetadataPermission::TestWrite, GroupKind::Access));
        assert!(nests(MetadataPermission::TestWrite, GroupKind::Level(AccessLevel::Full)));
        assert!(!nests(MetadataPermission::TestRead, GroupKind::Level(AccessLevel::Standard)));

        for permission in MetadataPermission::all() {
            assert!(group(*permission).direct.contains(&logger));
        }
    }

    #[test]
    fn disabled_metadata_project_skips_sample_metadata() {
        let config = testutil::config_with_dataset(
            "  - name: meta\n    components: { gcp: [sample-metadata] }\n    enable_metamist_project: false\n",
        );
        let rec = Arc::new(RecordingProvisioner::new());
        let (set, groups) = graphs(&config, rec.clone());
        let graph = set.graph("meta", CloudName::Gcp).unwrap();
        assert!(graph.build().is_empty());
        assert!(rec.calls().is_empty());
        assert!(groups.seal().unwrap().is_empty());
    }

    #[test]
    fn sample_metadata_is_unsupported_on_azure() {
        let config = testutil::azure_config();
        let rec = Arc::new(RecordingProvisioner::new());
        let azure =
            AzureInfra::new(&config.org, rec.clone(), Arc::new(BindingLedger::default())).unwrap();
        let mut infras: BTreeMap<CloudName, Arc<dyn CloudInfra>> = BTreeMap::new();
        infras.insert(CloudName::Azure, Arc::new(azure));
        let set = GraphSet::build(&config, &infras, Arc::new(GroupRegistry::new()));
        let graph = set.graph("fewgenomes", CloudName::Azure).unwrap();

        let err = graph.setup_sample_metadata().unwrap_err();
        assert!(err.is_unsupported());
        assert!(rec.calls().is_empty());
    }
}
