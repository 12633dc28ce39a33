//! One deployment run, as a strictly sequential state machine:
//! `Validated -> OrgBuilt -> DatasetsBuilt -> PluginsRun -> GroupsFinalized -> Done`.
//!
//! Failures inside a dataset are collected into the [`RunReport`] and the run
//! continues. Configuration errors, unsupported capabilities in the common
//! dataset and phase-guard violations abort the run.

use crate::cloud::azure::AzureInfra;
use crate::cloud::gcp::GcpInfra;
use crate::cloud::{
    BindingLedger, CloudInfra, Provisioner, RecordingProvisioner, ResourceRef, RoleBinding,
};
use crate::config::{MembershipDocument, ValidatedConfig};
use crate::deps;
use crate::error::{InfraError, Result};
use crate::graph::{ComponentFailure, DatasetCloudGraph, GraphSet};
use crate::groups::{self, FinalizeReport, GroupRegistry, GroupTarget, MembershipSnapshot};
use crate::plugin::{PluginContext, PluginFailure, PluginRegistry};
use crate::targets;
use crate::types::{CloudName, Principal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Validated,
    OrgBuilt,
    DatasetsBuilt,
    PluginsRun,
    GroupsFinalized,
    Done,
}

impl RunPhase {
    pub fn all() -> &'static [RunPhase] {
        &[
            RunPhase::Validated,
            RunPhase::OrgBuilt,
            RunPhase::DatasetsBuilt,
            RunPhase::PluginsRun,
            RunPhase::GroupsFinalized,
            RunPhase::Done,
        ]
    }

    pub fn next(self) -> Option<RunPhase> {
        RunPhase::all().get(self as usize + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Validated => "validated",
            RunPhase::OrgBuilt => "org_built",
            RunPhase::DatasetsBuilt => "datasets_built",
            RunPhase::PluginsRun => "plugins_run",
            RunPhase::GroupsFinalized => "groups_finalized",
            RunPhase::Done => "done",
        }
    }

    /// Move to `target`, which must be the immediate successor.
    pub fn advance(&mut self, target: RunPhase) -> Result<()> {
        if self.next() != Some(target) {
            return Err(InfraError::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        tracing::info!(phase = %target, "run phase reached");
        *self = target;
        Ok(())
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// One recorded failure. `unit` names what failed: a component, a binding,
/// a membership entry, a plugin hook or a group target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudName>,
    pub unit: String,
    pub message: String,
    #[serde(default)]
    pub unsupported: bool,
}

impl UnitFailure {
    fn in_graph(graph: &DatasetCloudGraph, unit: String, error: &InfraError) -> Self {
        Self {
            dataset: Some(graph.name().to_string()),
            cloud: Some(graph.cloud()),
            unit,
            message: error.to_string(),
            unsupported: error.is_unsupported(),
        }
    }

    fn component(graph: &DatasetCloudGraph, failure: &ComponentFailure) -> Self {
        Self::in_graph(graph, format!("component:{}", failure.component), &failure.error)
    }
}

impl From<PluginFailure> for UnitFailure {
    fn from(f: PluginFailure) -> Self {
        Self {
            dataset: None,
            cloud: None,
            unit: format!("plugin:{}/{}", f.plugin, f.hook),
            message: f.message,
            unsupported: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub failures: Vec<UnitFailure>,
    /// Every role binding granted during the run, once each.
    pub bindings: Vec<(CloudName, RoleBinding)>,
    pub finalize: FinalizeReport,
    pub snapshot: MembershipSnapshot,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.finalize.is_success()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Arc<ValidatedConfig>,
    members: MembershipDocument,
    registry: PluginRegistry,
    provisioners: BTreeMap<CloudName, Arc<dyn Provisioner>>,
    targets: Option<Vec<Arc<dyn GroupTarget>>>,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        config: ValidatedConfig,
        members: MembershipDocument,
        registry: PluginRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            members,
            registry,
            provisioners: BTreeMap::new(),
            targets: None,
            dry_run: false,
        }
    }

    /// Clouds without an explicit provisioner are recorded, not provisioned.
    pub fn with_provisioner(
        mut self,
        cloud: CloudName,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        self.provisioners.insert(cloud, provisioner);
        self
    }

    /// Push to `target`. Any explicit target replaces the configured set.
    pub fn with_target(mut self, target: Arc<dyn GroupTarget>) -> Self {
        self.targets.get_or_insert_with(Vec::new).push(target);
        self
    }

    /// Only push to cloud-native groups. The cache, metadata and batch
    /// targets talk to real systems and are skipped.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn config(&self) -> &Arc<ValidatedConfig> {
        &self.config
    }

    fn infras(
        &self,
        ledger: &Arc<BindingLedger>,
    ) -> Result<BTreeMap<CloudName, Arc<dyn CloudInfra>>> {
        let clouds: BTreeSet<CloudName> = self
            .config
            .datasets()
            .flat_map(|d| d.clouds().iter().copied())
            .collect();
        let mut infras: BTreeMap<CloudName, Arc<dyn CloudInfra>> = BTreeMap::new();
        for cloud in clouds {
            let provisioner = self
                .provisioners
                .get(&cloud)
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(RecordingProvisioner::new()) as Arc<dyn Provisioner>
                });
            let org = &self.config.org;
            let infra: Arc<dyn CloudInfra> = match cloud {
                CloudName::Gcp => Arc::new(GcpInfra::new(org, provisioner, Arc::clone(ledger))?),
                CloudName::Azure => {
                    Arc::new(AzureInfra::new(org, provisioner, Arc::clone(ledger))?)
                }
            };
            infras.insert(cloud, infra);
        }
        Ok(infras)
    }

    /// Add the membership document's users to one graph's groups.
    fn add_members(&self, graph: &DatasetCloudGraph, failures: &mut Vec<UnitFailure>) {
        for (kind, key) in self.members.members(graph.name()) {
            let Some(identity) = self.config.org.user_identity(key, graph.cloud()) else {
                tracing::debug!(
                    dataset = graph.name(),
                    cloud = %graph.cloud(),
                    user = key,
                    "user has no identity on this cloud"
                );
                continue;
            };
            if let Err(e) = graph.add_member(kind, Principal::user(identity.id.clone())) {
                failures.push(UnitFailure::in_graph(graph, format!("members:{kind}"), &e));
            }
        }
    }

    fn apply_bindings(
        &self,
        graphs: &GraphSet,
        cloud: CloudName,
        failures: &mut Vec<UnitFailure>,
    ) {
        for binding in deps::resolve(&self.config, cloud) {
            let Some(owner) = binding_owner(&self.config, &binding) else {
                tracing::debug!(resource = %binding.resource, "binding has no owning dataset");
                continue;
            };
            let result = graphs.graph(&owner, cloud).and_then(|g| g.apply(&binding));
            if let Err(e) = result {
                tracing::warn!(dataset = %owner, %cloud, "dependency binding failed: {e}");
                failures.push(UnitFailure {
                    dataset: Some(owner),
                    cloud: Some(cloud),
                    unit: format!("binding:{}/{}", binding.resource, binding.role),
                    message: e.to_string(),
                    unsupported: e.is_unsupported(),
                });
            }
        }
    }

    pub fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let mut phase = RunPhase::Validated;
        let mut failures: Vec<UnitFailure> = Vec::new();

        self.members.validate(&self.config)?;
        let mut plugins = self.registry.resolve(&self.config.org.plugins)?;

        let ledger = Arc::new(BindingLedger::default());
        let infras = self.infras(&ledger)?;
        let targets = match &self.targets {
            Some(targets) => targets.clone(),
            None if self.dry_run => targets::cloud_targets(&self.config.org, &infras),
            None => targets::default_targets(&self.config.org, &infras)?,
        };
        let registry = Arc::new(GroupRegistry::new());
        let graphs = GraphSet::build(&self.config, &infras, Arc::clone(&registry));
        let ctx = PluginContext {
            config: Arc::clone(&self.config),
            graphs: Arc::clone(&graphs),
            groups: Arc::clone(&registry),
        };
        tracing::info!(
            %run_id,
            datasets = self.config.order().len(),
            clouds = infras.len(),
            plugins = plugins.len(),
            targets = targets.len(),
            "run started"
        );

        // org-wide resources live in the common dataset
        let common = &self.config.org.common_dataset;
        for graph in graphs.for_dataset(common) {
            for failure in graph.build() {
                if failure.error.is_unsupported() {
                    tracing::error!(
                        cloud = %graph.cloud(),
                        "common dataset needs an unsupported capability"
                    );
                    return Err(failure.error);
                }
                failures.push(UnitFailure::component(graph, &failure));
            }
        }
        phase.advance(RunPhase::OrgBuilt)?;

        for name in self.config.order() {
            for graph in graphs.for_dataset(name) {
                if name != common {
                    failures.extend(
                        graph
                            .build()
                            .iter()
                            .map(|failure| UnitFailure::component(graph, failure)),
                    );
                }
                self.add_members(graph, &mut failures);
            }
        }
        for cloud in infras.keys() {
            self.apply_bindings(&graphs, *cloud, &mut failures);
        }
        phase.advance(RunPhase::DatasetsBuilt)?;

        failures.extend(plugins.call("on_org", |p| p.on_org(&ctx)).into_iter().map(Into::into));
        for name in self.config.order() {
            for graph in graphs.for_dataset(name) {
                let hook = plugins.call("on_dataset", |p| p.on_dataset(&ctx, graph));
                failures.extend(hook.into_iter().map(Into::into));
            }
        }
        failures.extend(
            plugins
                .call("on_groups", |p| p.on_groups(&ctx))
                .into_iter()
                .map(Into::into),
        );
        phase.advance(RunPhase::PluginsRun)?;

        let snapshot = registry.seal()?;
        let finalize = groups::finalize(&snapshot, &targets);
        failures.extend(finalize.failures.iter().map(|f| UnitFailure {
            dataset: None,
            cloud: None,
            unit: format!("target:{}/{}", f.target, f.group),
            message: f.message.clone(),
            unsupported: false,
        }));
        failures.extend(
            plugins
                .call("on_group_finalisation", |p| {
                    p.on_group_finalisation(&ctx, &snapshot)
                })
                .into_iter()
                .map(Into::into),
        );
        phase.advance(RunPhase::GroupsFinalized)?;
        phase.advance(RunPhase::Done)?;

        let bindings = ledger.bindings();
        tracing::info!(
            %run_id,
            failures = failures.len(),
            bindings = bindings.len(),
            groups = snapshot.len(),
            "run finished"
        );
        Ok(RunReport {
            run_id,
            phase,
            failures,
            bindings,
            finalize,
            snapshot,
        })
    }
}

/// The dataset whose graph applies `binding`: the grantee's dataset for group
/// grantees, otherwise the dataset owning the resource.
fn binding_owner(config: &ValidatedConfig, binding: &RoleBinding) -> Option<String> {
    if let Some(group) = binding.principal.as_group() {
        return Some(group.dataset.clone());
    }
    match &binding.resource {
        ResourceRef::BatchBillingProject { name } => Some(name.clone()),
        ResourceRef::Project { id } => config
            .datasets()
            .find(|d| d.project_id() == id)
            .map(|d| d.name.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::validate;
    use crate::plugin::InfraPlugin;
    use crate::targets::MembershipCache;
    use crate::testutil;
    use crate::types::{AccessLevel, GroupKind};
    use tempfile::TempDir;

    #[test]
    fn phases_only_move_forward_one_step() {
        let mut phase = RunPhase::Validated;
        assert!(phase.advance(RunPhase::DatasetsBuilt).is_err());
        phase.advance(RunPhase::OrgBuilt).unwrap();
        assert!(phase.advance(RunPhase::Validated).is_err());
        assert!(phase.advance(RunPhase::OrgBuilt).is_err());
        assert_eq!(phase, RunPhase::OrgBuilt);
        assert_eq!(RunPhase::Done.next(), None);
    }

    struct TouchMain;

    impl InfraPlugin for TouchMain {
        fn name(&self) -> &str {
            "touch-main"
        }

        fn on_org(&self, ctx: &PluginContext) -> Result<()> {
            ctx.graphs.graph("fewgenomes", CloudName::Gcp)?.main_bucket()?;
            Ok(())
        }

        fn on_dataset(&self, _ctx: &PluginContext, graph: &DatasetCloudGraph) -> Result<()> {
            if graph.name() == "fewgenomes" {
                graph.main_bucket()?;
            }
            Ok(())
        }
    }

    fn touch_main() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("touch-main", || Box::new(TouchMain));
        registry
    }

    #[test]
    fn common_and_fewgenomes_end_to_end() {
        let cache_dir = TempDir::new().unwrap();
        let mut metamist = mockito::Server::new();
        let metamist_mock = metamist
            .mock("PUT", "/api/v1/project/fewgenomes/members")
            .match_body(mockito::Matcher::Json(serde_json::json!([
                {"member": "alice@example.org", "role": "reader"}
            ])))
            .with_status(200)
            .expect(1)
            .create();
        let mut batch = mockito::Server::new();
        let batch_mock = batch
            .mock("POST", "/api/v1alpha/billing_projects/fewgenomes/users/alice/add")
            .with_status(200)
            .expect(1)
            .create();

        let yaml = format!(
            r#"infrastructure:
  domain: example.org
  budget_currency: AUD
  gcp: {{ region: australia-southeast1, groups_domain: example.org, dataset_storage_prefix: cpg- }}
  users:
    alice:
      clouds:
        gcp: {{ id: alice@example.org, hail_batch_username: alice }}
  plugins: [touch-main]
  membership_cache: {{ local_dir: "{}" }}
  metamist: {{ url: "{}" }}
  hail_batch: {{ url: "{}" }}
datasets:
  - name: common
    components: {{ gcp: [] }}
  - name: fewgenomes
    components: {{ gcp: [] }}
"#,
            cache_dir.path().display(),
            metamist.url(),
            batch.url(),
        );
        let config = validate(testutil::raw(&yaml)).unwrap();
        let members = MembershipDocument::parse(testutil::MEMBERS).unwrap();
        let rec = Arc::new(RecordingProvisioner::new());
        let report = Orchestrator::new(config, members, touch_main())
            .with_provisioner(CloudName::Gcp, rec.clone())
            .run()
            .unwrap();

        assert_eq!(report.phase, RunPhase::Done);
        assert!(report.is_success(), "{:?}", report.failures);

        // one bucket for fewgenomes, shared by both hooks; nothing for common
        assert_eq!(rec.count("bucket"), 1);
        assert_eq!(rec.count_where(|c| c.key == "fewgenomes-gcp-bucket-main"), 1);
        assert_eq!(rec.count_where(|c| c.key.starts_with("common-")), 0);

        // one group with one member, pushed to all four targets
        assert_eq!(report.snapshot.len(), 1);
        let access = report
            .snapshot
            .of_kind(CloudName::Gcp, "fewgenomes", GroupKind::Access)
            .unwrap();
        assert_eq!(access.flattened.len(), 1);
        assert_eq!(report.finalize.applied.len(), 4);
        assert_eq!(rec.count("group"), 1);
        assert_eq!(rec.count("group_member"), 1);
        let cache: MembershipCache = serde_json::from_str(
            &std::fs::read_to_string(cache_dir.path().join("access-group-cache.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(cache.groups.len(), 1);
        metamist_mock.assert();
        batch_mock.assert();
    }

    #[test]
    fn dataset_failures_are_collected_and_the_run_completes() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new().failing_when(|c| {
            c.key.starts_with("thousand-genomes-gcp-bucket-test")
        }));
        let report = Orchestrator::new(
            config,
            MembershipDocument::parse(testutil::MEMBERS).unwrap(),
            PluginRegistry::new(),
        )
        .with_provisioner(CloudName::Gcp, rec.clone())
        .run()
        .unwrap();

        assert_eq!(report.phase, RunPhase::Done);
        let units: BTreeSet<&str> = report.failures.iter().map(|f| f.unit.as_str()).collect();
        assert!(units.contains("component:storage"));
        assert!(units.contains("component:hail-accounts"));
        // independent components still ran
        assert_eq!(rec.count("budget"), 1);
        assert!(report
            .failures
            .iter()
            .all(|f| f.dataset.as_deref() == Some("thousand-genomes")));
        // tier grants only touch groups, so they survive the bucket failure
        let readers = report
            .snapshot
            .of_kind(CloudName::Gcp, "fewgenomes", GroupKind::Reader(AccessLevel::Test))
            .unwrap();
        assert_eq!(readers.direct.len(), 3);
    }

    #[test]
    fn unsupported_capabilities_are_recorded_outside_common() {
        let report = Orchestrator::new(
            testutil::azure_config(),
            MembershipDocument::default(),
            PluginRegistry::new(),
        )
        .run()
        .unwrap();
        let unsupported: Vec<&UnitFailure> =
            report.failures.iter().filter(|f| f.unsupported).collect();
        assert_eq!(unsupported.len(), 1);
        assert_eq!(unsupported[0].dataset.as_deref(), Some("fewgenomes"));
        assert_eq!(unsupported[0].cloud, Some(CloudName::Azure));
        assert_eq!(unsupported[0].unit, "component:analysis-runner");
    }

    #[test]
    fn unsupported_capabilities_in_common_abort() {
        let yaml = r#"infrastructure:
  domain: example.org
  budget_currency: AUD
  azure:
    region: australiaeast
    subscription: sub
    tenant: tenant
    dataset_storage_prefix: cpg-
datasets:
  - name: common
    deploy_locations: [azure]
    components: { azure: [analysis-runner] }
"#;
        let config = validate(testutil::raw(yaml)).unwrap();
        let err = Orchestrator::new(config, MembershipDocument::default(), PluginRegistry::new())
            .run()
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn unknown_plugins_stop_the_run_before_provisioning() {
        let config = validate(testutil::raw(&testutil::DEPLOYMENT.replace(
            "  can_access_internal_dataset_logs: [bob]\n",
            "  can_access_internal_dataset_logs: [bob]\n  plugins: [nope]\n",
        )))
        .unwrap();
        let rec = Arc::new(RecordingProvisioner::new());
        let err = Orchestrator::new(config, MembershipDocument::default(), PluginRegistry::new())
            .with_provisioner(CloudName::Gcp, rec.clone())
            .run()
            .unwrap_err();
        assert!(matches!(err, InfraError::Config(_)));
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn internal_operators_reach_log_and_billing_access() {
        let config = testutil::config_with_dataset(
            "  - name: ops\n    is_internal_dataset: true\n    components: { gcp: [] }\n",
        );
        let rec = Arc::new(RecordingProvisioner::new());
        let report = Orchestrator::new(config, MembershipDocument::default(), PluginRegistry::new())
            .with_provisioner(CloudName::Gcp, rec.clone())
            .run()
            .unwrap();
        let operators = report
            .snapshot
            .of_kind(CloudName::Gcp, "ops", GroupKind::InternalOperators)
            .unwrap();
        assert!(operators.direct.contains(&Principal::user("bob@example.org")));
        assert!(report.bindings.iter().any(|(_, b)| {
            b.principal == Principal::user("bob@example.org")
                && b.role == crate::cloud::Role::LogViewer
        }));
    }
}
