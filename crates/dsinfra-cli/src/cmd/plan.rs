use crate::inputs;
use crate::output::{print_json, print_section};
use anyhow::Context;
use dsinfra_core::cloud::{ProvisionCall, ProvisionRequest, RecordingProvisioner};
use dsinfra_core::naming;
use dsinfra_core::orchestrator::{Orchestrator, RunReport};
use dsinfra_core::plugin::PluginRegistry;
use dsinfra_core::types::CloudName;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the orchestrator against recording provisioners and report every call
/// it would have made. Nothing outside the process is touched.
pub fn run(
    config_path: &Path,
    members_path: &Path,
    dataset: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let config = inputs::load_config(config_path)?;
    let members = inputs::load_members(members_path, &config)?;
    if let Some(name) = dataset {
        config.dataset(name)?;
    }

    let clouds: BTreeSet<CloudName> = config
        .datasets()
        .flat_map(|d| d.clouds().iter().copied())
        .collect();

    let mut recorders = BTreeMap::new();
    let mut orchestrator = Orchestrator::new(config, members, PluginRegistry::new()).dry_run();
    for cloud in clouds {
        let recorder = Arc::new(RecordingProvisioner::new());
        orchestrator = orchestrator.with_provisioner(cloud, recorder.clone());
        recorders.insert(cloud, recorder);
    }

    let report = orchestrator.run().context("plan aborted")?;
    let calls: Vec<ProvisionCall> = recorders
        .values()
        .flat_map(|r| r.calls())
        .filter(|c| dataset.is_none_or(|name| belongs_to(c, name)))
        .collect();

    if json {
        print_json(&plan_json(&report, &calls, dataset))?;
    } else {
        print_plan(&report, &calls, dataset);
    }

    let failed = report.failures.len();
    if failed > 0 {
        anyhow::bail!("plan recorded {failed} failure(s)");
    }
    Ok(())
}

fn belongs_to(call: &ProvisionCall, dataset: &str) -> bool {
    call.key
        .starts_with(&naming::resource_key(dataset, call.cloud, ""))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn plan_json(
    report: &RunReport,
    calls: &[ProvisionCall],
    dataset: Option<&str>,
) -> serde_json::Value {
    let groups: Vec<_> = report
        .snapshot
        .groups()
        .iter()
        .filter(|g| dataset.is_none_or(|name| g.group.dataset == name))
        .collect();
    serde_json::json!({
        "run_id": report.run_id,
        "phase": report.phase,
        "calls": calls,
        "groups": groups,
        "bindings": report.bindings,
        "failures": report.failures,
        "finalize": report.finalize,
    })
}

fn print_plan(report: &RunReport, calls: &[ProvisionCall], dataset: Option<&str>) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for call in calls {
        *counts.entry(call.request.kind()).or_insert(0) += 1;
    }
    let summary: Vec<String> = counts.iter().map(|(k, n)| format!("{k}={n}")).collect();
    println!("Plan {} ({})", report.run_id, report.phase);
    println!("{} call(s): {}", calls.len(), summary.join(" "));
    println!();

    let rows: Vec<Vec<String>> = calls
        .iter()
        .map(|c| {
            vec![
                c.cloud.to_string(),
                c.request.kind().to_string(),
                describe(&c.request),
                c.key.clone(),
            ]
        })
        .collect();
    print_section("Calls", &["CLOUD", "KIND", "TARGET", "KEY"], &rows);

    let rows: Vec<Vec<String>> = report
        .snapshot
        .groups()
        .iter()
        .filter(|g| dataset.is_none_or(|name| g.group.dataset == name))
        .map(|g| {
            vec![
                g.group.cloud.to_string(),
                g.group.address.clone(),
                g.direct.len().to_string(),
                g.flattened.len().to_string(),
            ]
        })
        .collect();
    print_section("Groups", &["CLOUD", "GROUP", "DIRECT", "MEMBERS"], &rows);

    let rows: Vec<Vec<String>> = report
        .failures
        .iter()
        .map(|f| {
            vec![
                f.dataset.clone().unwrap_or_else(|| "-".into()),
                f.cloud.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                f.unit.clone(),
                f.message.clone(),
            ]
        })
        .collect();
    print_section("Failures", &["DATASET", "CLOUD", "UNIT", "MESSAGE"], &rows);
}

/// What a call acts on, in one short string.
fn describe(request: &ProvisionRequest) -> String {
    match request {
        ProvisionRequest::Project { name, .. } => name.clone(),
        ProvisionRequest::Bucket { name, .. } => name.clone(),
        ProvisionRequest::ServiceAccount { name, project } => format!("{project}/{name}"),
        ProvisionRequest::Secret { name, project, .. } => format!("{project}/{name}"),
        ProvisionRequest::Registry { name, project, .. } => format!("{project}/{name}"),
        ProvisionRequest::Budget {
            project,
            amount,
            currency,
            ..
        } => format!("{project} {amount} {currency}"),
        ProvisionRequest::Group { address, .. } => address.clone(),
        ProvisionRequest::GroupMember { group, member } => format!("{group} += {member}"),
        ProvisionRequest::RoleGrant {
            member,
            resource,
            role,
        } => format!("{member} {role} on {resource}"),
        ProvisionRequest::Blob { bucket, path, .. } => format!("{bucket}/{path}"),
    }
}
