//! Group targets: the external systems that mirror sealed membership.
//!
//! Targets are built from [`OrgConfig`]. Cloud-native groups exist for every
//! cloud with an implementation; the cache, metadata and batch targets only
//! when their section is configured.

mod batch;
mod cache;
mod cloud;
mod metamist;

pub use batch::BatchBillingTarget;
pub use cache::{
    BlobStore, CacheBlobTarget, CachedGroup, CloudBlobStore, LocalBlobStore, MembershipCache,
};
pub use cloud::CloudGroupTarget;
pub use metamist::MetamistTarget;

use crate::cloud::CloudInfra;
use crate::config::OrgConfig;
use crate::error::{ConfigError, ConfigIssue, Result};
use crate::groups::GroupTarget;
use crate::types::CloudName;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn http_client() -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()?)
}

/// Cloud-native group targets only. These go through the cloud interface,
/// so they are safe in a dry run.
pub fn cloud_targets(
    org: &OrgConfig,
    infras: &BTreeMap<CloudName, Arc<dyn CloudInfra>>,
) -> Vec<Arc<dyn GroupTarget>> {
    infras
        .values()
        .map(|infra| {
            let target = CloudGroupTarget::new(Arc::clone(infra));
            let target = if org.disable_group_memberships {
                target.without_members()
            } else {
                target
            };
            Arc::new(target) as Arc<dyn GroupTarget>
        })
        .collect()
}

/// Every configured target, cloud groups first.
pub fn default_targets(
    org: &OrgConfig,
    infras: &BTreeMap<CloudName, Arc<dyn CloudInfra>>,
) -> Result<Vec<Arc<dyn GroupTarget>>> {
    let mut targets = cloud_targets(org, infras);

    if let Some(cache) = &org.membership_cache {
        let store: Box<dyn BlobStore> = match (&cache.local_dir, &cache.bucket) {
            (Some(dir), _) => Box::new(LocalBlobStore::new(dir.clone())),
            (None, Some(bucket)) => {
                let infra = infras.get(&cache.cloud).ok_or_else(|| ConfigError {
                    issues: vec![ConfigIssue::new(
                        "infrastructure.membership_cache.cloud",
                        format!("no infrastructure for '{}'", cache.cloud),
                    )],
                })?;
                Box::new(CloudBlobStore::new(Arc::clone(infra), bucket.clone()))
            }
            (None, None) => {
                return Err(ConfigError {
                    issues: vec![ConfigIssue::new(
                        "infrastructure.membership_cache",
                        "exactly one of local_dir and bucket must be set",
                    )],
                }
                .into())
            }
        };
        targets.push(Arc::new(CacheBlobTarget::new(store, cache.name.clone())));
    }

    if let Some(metamist) = &org.metamist {
        targets.push(Arc::new(MetamistTarget::new(
            http_client()?,
            metamist.url.clone(),
            metamist.identity_cloud,
        )));
    }

    if let Some(batch) = &org.hail_batch {
        targets.push(Arc::new(BatchBillingTarget::new(
            http_client()?,
            batch.url.clone(),
            batch.identity_cloud,
            org,
        )));
    }

    Ok(targets)
}
