use anyhow::Context;
use dsinfra_core::config::{self, MembershipDocument, RawDeployment, ValidatedConfig};
use std::path::{Path, PathBuf};

pub const DEPLOYMENT_FILE: &str = "deployment.yaml";
pub const MEMBERS_FILE: &str = "members.yaml";

/// Resolve the deployment document.
///
/// Priority:
/// 1. `--config` flag / `DSINFRA_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `deployment.yaml`
/// 3. Fall back to `cwd/deployment.yaml`
pub fn resolve_config(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir = cwd.clone();
    loop {
        let candidate = dir.join(DEPLOYMENT_FILE);
        if candidate.is_file() {
            return candidate;
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => break,
        }
    }

    cwd.join(DEPLOYMENT_FILE)
}

/// The membership document defaults to `members.yaml` beside the deployment.
pub fn resolve_members(explicit: Option<&Path>, config: &Path) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => config
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(MEMBERS_FILE),
    }
}

pub fn load_raw(path: &Path) -> anyhow::Result<RawDeployment> {
    RawDeployment::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Load and validate; every issue ends up in the error.
pub fn load_config(path: &Path) -> anyhow::Result<ValidatedConfig> {
    let raw = load_raw(path)?;
    Ok(config::validate(raw)?)
}

pub fn load_members(path: &Path, config: &ValidatedConfig) -> anyhow::Result<MembershipDocument> {
    let members = MembershipDocument::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    members.validate(config)?;
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_wins() {
        let p = Path::new("/tmp/elsewhere.yaml");
        assert_eq!(resolve_config(Some(p)), p);
    }

    #[test]
    fn members_sit_beside_the_config() {
        let config = Path::new("/srv/infra/deployment.yaml");
        assert_eq!(
            resolve_members(None, config),
            Path::new("/srv/infra/members.yaml")
        );
        assert_eq!(
            resolve_members(Some(Path::new("m.yaml")), config),
            Path::new("m.yaml")
        );
    }
}
