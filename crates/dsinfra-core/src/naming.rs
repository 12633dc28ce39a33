use crate::config::OrgConfig;
use crate::types::{CloudName, GroupKind, GroupRef};
use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Lifecycle constants (days)
// ---------------------------------------------------------------------------

pub const UNDELETE_DAYS: u32 = 30;
pub const TMP_DAYS: u32 = 8;
pub const ARCHIVE_DAYS: u32 = 30;

// ---------------------------------------------------------------------------
// Logical names
// ---------------------------------------------------------------------------

/// `{prefix}{dataset}-{kind}`, e.g. `fewgenomes-data-manager`.
pub fn group_name(prefix: &str, dataset: &str, kind: GroupKind) -> String {
    format!("{prefix}{dataset}-{kind}")
}

/// Logical reference to a dataset group. GCP groups are addressed by email
/// in the groups domain, Azure groups by display name.
pub fn group_ref(org: &OrgConfig, cloud: CloudName, dataset: &str, kind: GroupKind) -> GroupRef {
    let name = group_name(&org.group_prefix, dataset, kind);
    let address = match (cloud, &org.gcp) {
        (CloudName::Gcp, Some(gcp)) => format!("{name}@{}", gcp.groups_domain),
        _ => name.clone(),
    };
    GroupRef {
        cloud,
        dataset: dataset.to_string(),
        kind,
        name,
        address,
    }
}

/// Stable logical key for a resource owned by one dataset graph.
pub fn resource_key(dataset: &str, cloud: CloudName, resource: &str) -> String {
    format!("{dataset}-{cloud}-{resource}")
}

/// Bucket name derived from the cloud's storage prefix, unless the caller
/// asked for the name verbatim.
pub fn bucket_name(storage_prefix: &str, dataset: &str, name: &str, unique: bool) -> String {
    if unique {
        name.to_string()
    } else {
        format!("{storage_prefix}{dataset}-{name}")
    }
}

/// Azure storage accounts only accept lowercase letters.
pub fn azure_alphanumeric(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase())
        .collect()
}

static EXTERNAL_SA_RE: OnceLock<Regex> = OnceLock::new();

fn external_sa_re() -> &'static Regex {
    EXTERNAL_SA_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").expect("static regex"))
}

/// Turn a foreign service-account address into something usable inside a
/// resource key.
pub fn external_sa_name(address: &str) -> String {
    external_sa_re().replace_all(address, "-").into_owned()
}

/// Resource key for a foreign service account referenced by address.
pub fn external_account_key(dataset: &str, cloud: CloudName, address: &str) -> String {
    resource_key(dataset, cloud, &external_sa_name(address))
}

// ---------------------------------------------------------------------------
// Slug validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").expect("static regex")
    })
}

pub fn is_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 64 && slug_re().is_match(slug)
}
