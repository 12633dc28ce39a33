use crate::cloud::CloudInfra;
use crate::error::Result;
use crate::groups::{GroupPushError, GroupTarget, MembershipSnapshot};
use crate::io;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Where the cache artifact lands.
pub trait BlobStore: Send + Sync {
    fn location(&self) -> String;
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
}

pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl BlobStore for LocalBlobStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        io::atomic_write(&self.dir.join(name), data)
    }
}

/// A bucket on one cloud, written through the cloud interface.
pub struct CloudBlobStore {
    infra: Arc<dyn CloudInfra>,
    bucket: String,
}

impl CloudBlobStore {
    pub fn new(infra: Arc<dyn CloudInfra>, bucket: impl Into<String>) -> Self {
        Self {
            infra,
            bucket: bucket.into(),
        }
    }
}

impl BlobStore for CloudBlobStore {
    fn location(&self) -> String {
        format!("{}://{}", self.infra.name(), self.bucket)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let key = format!("membership-cache-{}", self.bucket);
        self.infra.upload_blob(&key, &self.bucket, name, data)
    }
}

/// One group in the cache artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGroup {
    /// Member keys as added (`user:`, `serviceAccount:`, `group:`), so
    /// readers can rebuild the nesting.
    pub direct: BTreeSet<String>,
    /// Ids of every user and machine identity reachable through nesting.
    pub flattened: BTreeSet<String>,
}

/// The cache artifact, keyed by group address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipCache {
    pub generated_at: DateTime<Utc>,
    pub groups: BTreeMap<String, CachedGroup>,
}

impl MembershipCache {
    pub fn from_snapshot(snapshot: &MembershipSnapshot) -> Self {
        let groups = snapshot
            .groups()
            .iter()
            .map(|g| {
                let cached = CachedGroup {
                    direct: g.direct.iter().map(|p| p.member_key()).collect(),
                    flattened: g.flattened.iter().map(|p| p.id().to_string()).collect(),
                };
                (g.group.address.clone(), cached)
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            groups,
        }
    }
}

pub struct CacheBlobTarget {
    store: Box<dyn BlobStore>,
    name: String,
}

impl CacheBlobTarget {
    pub fn new(store: Box<dyn BlobStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    fn write(&self, snapshot: &MembershipSnapshot) -> Result<()> {
        let cache = MembershipCache::from_snapshot(snapshot);
        let data = serde_json::to_vec_pretty(&cache)?;
        self.store.put(&self.name, &data)
    }
}

impl GroupTarget for CacheBlobTarget {
    fn id(&self) -> String {
        format!("membership-cache:{}", self.store.location())
    }

    fn push(&self, snapshot: &MembershipSnapshot) -> Vec<GroupPushError> {
        match self.write(snapshot) {
            Ok(()) => Vec::new(),
            // one artifact, so a failure covers every group
            Err(e) => vec![GroupPushError::new("(all)", e.to_string())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::gcp::GcpInfra;
    use crate::cloud::{BindingLedger, ProvisionRequest, RecordingProvisioner};
    use crate::groups::GroupRegistry;
    use crate::naming;
    use crate::testutil;
    use crate::types::{CloudName, GroupKind, Principal};
    use tempfile::TempDir;

    fn snapshot() -> MembershipSnapshot {
        let config = testutil::config();
        let reg = GroupRegistry::new();
        let access = naming::group_ref(&config.org, CloudName::Gcp, "fewgenomes", GroupKind::Access);
        let analysis =
            naming::group_ref(&config.org, CloudName::Gcp, "fewgenomes", GroupKind::Analysis);
        reg.add_member(&access, Principal::Group(analysis.clone())).unwrap();
        reg.add_member(&analysis, Principal::user("alice@example.org")).unwrap();
        reg.seal().unwrap()
    }

    #[test]
    fn local_cache_holds_flattened_members() {
        let dir = TempDir::new().unwrap();
        let target = CacheBlobTarget::new(Box::new(LocalBlobStore::new(dir.path())), "cache.json");
        assert!(target.push(&snapshot()).is_empty());

        let data = std::fs::read_to_string(dir.path().join("cache.json")).unwrap();
        let cache: MembershipCache = serde_json::from_str(&data).unwrap();
        assert_eq!(
            cache.groups["fewgenomes-access@example.org"].flattened,
            BTreeSet::from(["alice@example.org".to_string()])
        );
        assert_eq!(cache.groups.len(), 2);
    }

    #[test]
    fn local_cache_keeps_the_nesting() {
        let dir = TempDir::new().unwrap();
        let target = CacheBlobTarget::new(Box::new(LocalBlobStore::new(dir.path())), "cache.json");
        assert!(target.push(&snapshot()).is_empty());

        let data = std::fs::read_to_string(dir.path().join("cache.json")).unwrap();
        let cache: MembershipCache = serde_json::from_str(&data).unwrap();
        assert_eq!(
            cache.groups["fewgenomes-access@example.org"].direct,
            BTreeSet::from(["group:fewgenomes-analysis@example.org".to_string()])
        );
        assert_eq!(
            cache.groups["fewgenomes-analysis@example.org"].direct,
            BTreeSet::from(["user:alice@example.org".to_string()])
        );
    }

    #[test]
    fn unwritable_location_fails_every_group() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let target = CacheBlobTarget::new(Box::new(LocalBlobStore::new(&blocker)), "cache.json");
        let errors = target.push(&snapshot());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].group, "(all)");
    }

    #[test]
    fn cloud_cache_is_uploaded_through_the_infra() {
        let config = testutil::config();
        let rec = Arc::new(RecordingProvisioner::new());
        let gcp = GcpInfra::new(&config.org, rec.clone(), Arc::new(BindingLedger::default()))
            .unwrap();
        let store = CloudBlobStore::new(Arc::new(gcp), "cpg-common-main");
        let target = CacheBlobTarget::new(Box::new(store), "access-group-cache.json");
        assert_eq!(target.id(), "membership-cache:gcp://cpg-common-main");
        assert!(target.push(&snapshot()).is_empty());
        match &rec.calls()[0].request {
            ProvisionRequest::Blob { bucket, path, size } => {
                assert_eq!(bucket, "cpg-common-main");
                assert_eq!(path, "access-group-cache.json");
                assert!(*size > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
