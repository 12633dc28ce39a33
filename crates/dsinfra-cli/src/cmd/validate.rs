use crate::inputs;
use crate::output::print_json;
use anyhow::Context;
use dsinfra_core::config::{self, MembershipDocument};
use dsinfra_core::error::ConfigIssue;
use std::path::Path;

/// Validate the deployment, then the membership document against it.
/// Membership is only checked when the deployment itself is valid.
pub fn run(config_path: &Path, members_path: &Path, json: bool) -> anyhow::Result<()> {
    let raw = inputs::load_raw(config_path)?;

    let mut issues: Vec<ConfigIssue> = Vec::new();
    let mut order: Vec<String> = Vec::new();
    match config::validate(raw) {
        Ok(config) => {
            order = config.order().to_vec();
            let members = MembershipDocument::load(members_path)
                .with_context(|| format!("failed to load {}", members_path.display()))?;
            if let Err(e) = members.validate(&config) {
                issues.extend(e.issues);
            }
        }
        Err(e) => issues.extend(e.issues),
    }

    if json {
        let value = serde_json::json!({
            "valid": issues.is_empty(),
            "datasets": order,
            "issues": issues,
        });
        print_json(&value)?;
    } else if issues.is_empty() {
        println!(
            "Deployment is valid: {} dataset(s), build order {}.",
            order.len(),
            order.join(" -> ")
        );
    } else {
        for issue in &issues {
            println!("[error] {issue}");
        }
    }

    if !issues.is_empty() {
        anyhow::bail!("validation found {} issue(s)", issues.len());
    }

    Ok(())
}
