use crate::error::Result;
use crate::groups::{GroupMembers, GroupPushError, GroupTarget, MembershipSnapshot};
use crate::types::{CloudName, GroupKind};
use reqwest::blocking::Client;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ProjectRole {
    Reader,
    Writer,
}

#[derive(Debug, Serialize)]
struct ProjectMember<'a> {
    member: &'a str,
    role: ProjectRole,
}

/// Project membership in the sample metadata service. Access and
/// metadata-access members read; data managers write.
pub struct MetamistTarget {
    client: Client,
    url: String,
    cloud: CloudName,
}

impl MetamistTarget {
    pub fn new(client: Client, url: impl Into<String>, cloud: CloudName) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            cloud,
        }
    }

    fn put(&self, dataset: &str, members: &[ProjectMember<'_>]) -> Result<()> {
        self.client
            .put(format!("{}/api/v1/project/{dataset}/members", self.url))
            .json(members)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

fn member_ids(group: Option<&GroupMembers>) -> impl Iterator<Item = &str> {
    group
        .into_iter()
        .flat_map(|g| g.flattened.iter().map(|p| p.id()))
}

impl GroupTarget for MetamistTarget {
    fn id(&self) -> String {
        format!("metamist:{}", self.url)
    }

    fn push(&self, snapshot: &MembershipSnapshot) -> Vec<GroupPushError> {
        let mut errors = Vec::new();
        for dataset in snapshot.datasets(self.cloud) {
            let group = |kind| snapshot.of_kind(self.cloud, dataset, kind);
            let Some(anchor) = group(GroupKind::Access)
                .or(group(GroupKind::DataManager))
                .or(group(GroupKind::MetadataAccess))
            else {
                continue;
            };

            let mut roles: BTreeMap<&str, ProjectRole> = BTreeMap::new();
            for id in member_ids(group(GroupKind::Access))
                .chain(member_ids(group(GroupKind::MetadataAccess)))
            {
                roles.insert(id, ProjectRole::Reader);
            }
            for id in member_ids(group(GroupKind::DataManager)) {
                roles.insert(id, ProjectRole::Writer);
            }

            let body: Vec<ProjectMember<'_>> = roles
                .into_iter()
                .map(|(member, role)| ProjectMember { member, role })
                .collect();
            if let Err(e) = self.put(dataset, &body) {
                errors.push(GroupPushError::new(anchor.group.name.clone(), e.to_string()));
            }
        }
        errors
    }
}
