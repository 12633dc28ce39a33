//! Plugins extend a run with extra resources or group pushes. They see the
//! same graphs, clouds and group registry as the built-in components, so a
//! bucket a plugin asks for is the one the dataset graph would create.

use crate::config::ValidatedConfig;
use crate::error::{ConfigError, ConfigIssue, InfraError, Result};
use crate::graph::{DatasetCloudGraph, GraphSet};
use crate::groups::{GroupRegistry, MembershipSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct PluginContext {
    pub config: Arc<ValidatedConfig>,
    pub graphs: Arc<GraphSet>,
    pub groups: Arc<GroupRegistry>,
}

/// Hooks run in this order: `on_org` once, `on_dataset` per dataset graph
/// (dependencies first), `on_groups` once before sealing, then
/// `on_group_finalisation` with the sealed snapshot.
pub trait InfraPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_org(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    fn on_dataset(&self, _ctx: &PluginContext, _graph: &DatasetCloudGraph) -> Result<()> {
        Ok(())
    }

    fn on_groups(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    fn on_group_finalisation(
        &self,
        _ctx: &PluginContext,
        _snapshot: &MembershipSnapshot,
    ) -> Result<()> {
        Ok(())
    }
}

pub type PluginFactory = Box<dyn Fn() -> Box<dyn InfraPlugin> + Send + Sync>;

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration under the same id wins.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn() -> Box<dyn InfraPlugin> + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert(id.into(), Box::new(factory));
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate `ids` in the declared order. Every unknown id is reported.
    pub fn resolve(&self, ids: &[String]) -> Result<ActivePlugins> {
        let mut issues = Vec::new();
        let mut plugins = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            match self.factories.get(id) {
                Some(factory) => plugins.push(ActivePlugin {
                    id: id.clone(),
                    plugin: factory(),
                    failed: false,
                }),
                None => issues.push(ConfigIssue::new(
                    format!("infrastructure.plugins[{i}]"),
                    format!("unknown plugin '{id}'"),
                )),
            }
        }
        if !issues.is_empty() {
            return Err(ConfigError { issues }.into());
        }
        Ok(ActivePlugins { plugins })
    }
}

// ---------------------------------------------------------------------------
// ActivePlugins
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFailure {
    pub plugin: String,
    pub hook: String,
    pub message: String,
}

impl From<PluginFailure> for InfraError {
    fn from(f: PluginFailure) -> Self {
        InfraError::Plugin {
            plugin: f.plugin,
            message: format!("{}: {}", f.hook, f.message),
        }
    }
}

struct ActivePlugin {
    id: String,
    plugin: Box<dyn InfraPlugin>,
    failed: bool,
}

/// Resolved plugins for one run. A plugin whose hook fails is skipped for
/// the rest of the run; the others carry on.
pub struct ActivePlugins {
    plugins: Vec<ActivePlugin>,
}

impl ActivePlugins {
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.id.as_str())
    }

    /// Run `hook` on every plugin still in good standing.
    pub fn call(
        &mut self,
        hook: &str,
        mut f: impl FnMut(&dyn InfraPlugin) -> Result<()>,
    ) -> Vec<PluginFailure> {
        let mut failures = Vec::new();
        for active in self.plugins.iter_mut().filter(|p| !p.failed) {
            if let Err(e) = f(active.plugin.as_ref()) {
                tracing::warn!(plugin = %active.id, hook, "plugin failed: {e}");
                active.failed = true;
                failures.push(PluginFailure {
                    plugin: active.id.clone(),
                    hook: hook.to_string(),
                    message: e.to_string(),
                });
            }
        }
        failures
    }
}
