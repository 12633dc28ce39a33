//! Cross-dataset access: ordering datasets and expanding `depends_on`, the
//! implicit `common` edge and the internal-dataset edge into role bindings.

use crate::cloud::{ResourceRef, Role, RoleBinding};
use crate::config::ValidatedConfig;
use crate::error::{InfraError, Result};
use crate::naming;
use crate::types::{
    AccessLevel, BucketPermission, CloudName, Component, GroupKind, Principal, RegistryMembership,
};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Datasets ordered dependencies-first. Edges to unknown names are ignored;
/// validation reports those separately.
pub fn topological_order(edges: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut order = Vec::with_capacity(edges.len());
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(node.to_string());
                return Err(InfraError::DependencyCycle { cycle });
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for dep in edges.get(node).into_iter().flatten() {
            if edges.contains_key(dep) {
                visit(dep, edges, marks, stack, order)?;
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        order.push(node.to_string());
        Ok(())
    }

    for node in edges.keys() {
        visit(node, edges, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Every binding implied by dataset relationships on one cloud, sorted and
/// deduplicated. Tier grants name the reading dataset's access-level group.
pub fn resolve(config: &ValidatedConfig, cloud: CloudName) -> Vec<RoleBinding> {
    let org = &config.org;
    let mut bindings = BTreeSet::new();

    for dataset in config.datasets().filter(|d| d.deploys_to(cloud)) {
        let level_group = |level| {
            Principal::Group(naming::group_ref(
                org,
                cloud,
                &dataset.name,
                GroupKind::Level(level),
            ))
        };

        for level in dataset.access_levels() {
            for dep in &dataset.depends_on {
                let Ok(target) = config.dataset(dep) else { continue };
                if !target.deploys_to(cloud) {
                    continue;
                }
                for readable in level
                    .readable_levels()
                    .filter(|l| target.access_levels().contains(l))
                {
                    bindings.insert(RoleBinding::new(
                        level_group(level),
                        ResourceRef::AccessTier {
                            dataset: dep.clone(),
                            level: readable,
                        },
                        Role::Bucket(BucketPermission::Read),
                    ));
                }
            }
            for dep in &dataset.depends_on_readonly {
                let Ok(target) = config.dataset(dep) else { continue };
                if !target.deploys_to(cloud) {
                    continue;
                }
                for readable in [AccessLevel::Test, AccessLevel::Standard]
                    .into_iter()
                    .filter(|l| target.access_levels().contains(l))
                {
                    bindings.insert(RoleBinding::new(
                        level_group(level),
                        ResourceRef::AccessTier {
                            dataset: dep.clone(),
                            level: readable,
                        },
                        Role::Bucket(BucketPermission::Read),
                    ));
                }
            }

            if dataset.name != org.common_dataset
                && dataset.has_component(cloud, Component::ContainerRegistry)
            {
                bindings.insert(RoleBinding::new(
                    level_group(level),
                    ResourceRef::Registry {
                        name: org.common_dataset.clone(),
                    },
                    Role::Registry(RegistryMembership::Reader),
                ));
            }
        }

        if dataset.is_internal_dataset {
            for operator in &org.can_access_internal_dataset_logs {
                let Some(identity) = org.user_identity(operator, cloud) else {
                    continue;
                };
                let principal = Principal::user(identity.id.clone());
                bindings.insert(RoleBinding::new(
                    principal.clone(),
                    ResourceRef::Project {
                        id: dataset.project_id().to_string(),
                    },
                    Role::LogViewer,
                ));
                bindings.insert(RoleBinding::new(
                    principal,
                    ResourceRef::BatchBillingProject {
                        name: dataset.name.clone(),
                    },
                    Role::BatchBillingMember,
                ));
            }
        }
    }

    bindings.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn edges(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn dependencies_come_first() {
        let order =
            topological_order(&edges(&[("a", &["c"]), ("b", &["a"]), ("c", &[])])).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn cycles_name_their_members() {
        let err = topological_order(&edges(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]))
            .unwrap_err();
        match err {
            InfraError::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn tiers_read_by(
        bindings: &[RoleBinding],
        dataset: &str,
        level: AccessLevel,
    ) -> Vec<(String, AccessLevel)> {
        bindings
            .iter()
            .filter(|b| {
                b.principal
                    .as_group()
                    .is_some_and(|g| g.dataset == dataset && g.kind == GroupKind::Level(level))
            })
            .filter_map(|b| match &b.resource {
                ResourceRef::AccessTier { dataset, level } => Some((dataset.clone(), *level)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_identity_reads_only_the_test_tier() {
        let config = testutil::config();
        let bindings = resolve(&config, CloudName::Gcp);
        assert_eq!(
            tiers_read_by(&bindings, "thousand-genomes", AccessLevel::Test),
            vec![("fewgenomes".to_string(), AccessLevel::Test)]
        );
        assert_eq!(
            tiers_read_by(&bindings, "thousand-genomes", AccessLevel::Full).len(),
            3
        );
        // no reverse edge
        assert!(tiers_read_by(&bindings, "fewgenomes", AccessLevel::Full).is_empty());
    }

    #[test]
    fn readonly_dependencies_stop_at_standard() {
        let config = testutil::config_with_dataset(
            "  - name: reader\n    depends_on_readonly: [fewgenomes]\n    components: { gcp: [] }\n",
        );
        let bindings = resolve(&config, CloudName::Gcp);
        let full = tiers_read_by(&bindings, "reader", AccessLevel::Full);
        assert_eq!(full.len(), 2);
        assert!(full.iter().all(|(_, l)| *l != AccessLevel::Full));
    }

    #[test]
    fn common_registry_read_follows_the_component() {
        let config = testutil::config();
        let bindings = resolve(&config, CloudName::Gcp);
        let registry_readers: BTreeSet<_> = bindings
            .iter()
            .filter(|b| matches!(b.resource, ResourceRef::Registry { .. }))
            .filter_map(|b| b.principal.as_group().map(|g| g.dataset.clone()))
            .collect();
        // fewgenomes disables every component
        assert_eq!(registry_readers, BTreeSet::from(["thousand-genomes".to_string()]));
    }

    #[test]
    fn internal_datasets_expose_logs_and_billing_to_operators() {
        let config = testutil::config_with_dataset(
            "  - name: ops\n    is_internal_dataset: true\n    components: { gcp: [] }\n",
        );
        let bindings = resolve(&config, CloudName::Gcp);
        let operator: Vec<_> = bindings
            .iter()
            .filter(|b| b.principal == Principal::user("bob@example.org"))
            .map(|b| b.role.clone())
            .collect();
        assert_eq!(operator, vec![Role::LogViewer, Role::BatchBillingMember]);
    }

    #[test]
    fn other_clouds_see_nothing() {
        let config = testutil::config();
        assert!(resolve(&config, CloudName::Azure).is_empty());
    }
}
