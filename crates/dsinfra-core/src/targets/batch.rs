use crate::config::OrgConfig;
use crate::error::Result;
use crate::groups::{GroupPushError, GroupTarget, MembershipSnapshot};
use crate::types::{CloudName, GroupKind};
use reqwest::blocking::Client;
use std::collections::{BTreeMap, BTreeSet};

/// Billing-project membership in the batch service. Everyone with access to
/// a dataset, plus its internal operators, may bill batch work to it.
pub struct BatchBillingTarget {
    client: Client,
    url: String,
    cloud: CloudName,
    /// cloud identity id -> batch username
    usernames: BTreeMap<String, String>,
}

impl BatchBillingTarget {
    pub fn new(client: Client, url: impl Into<String>, cloud: CloudName, org: &OrgConfig) -> Self {
        let usernames = org
            .users
            .values()
            .filter_map(|user| user.clouds.get(&cloud))
            .filter_map(|identity| {
                let username = identity.hail_batch_username.clone()?;
                Some((identity.id.clone(), username))
            })
            .collect();
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            cloud,
            usernames,
        }
    }

    fn add_user(&self, project: &str, username: &str) -> Result<()> {
        self.client
            .post(format!(
                "{}/api/v1alpha/billing_projects/{project}/users/{username}/add",
                self.url
            ))
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

impl GroupTarget for BatchBillingTarget {
    fn id(&self) -> String {
        format!("batch-billing:{}", self.url)
    }

    fn push(&self, snapshot: &MembershipSnapshot) -> Vec<GroupPushError> {
        let mut errors = Vec::new();
        for dataset in snapshot.datasets(self.cloud) {
            let mut users = BTreeSet::new();
            for kind in [GroupKind::Access, GroupKind::InternalOperators] {
                let Some(group) = snapshot.of_kind(self.cloud, dataset, kind) else {
                    continue;
                };
                for member in &group.flattened {
                    match self.usernames.get(member.id()) {
                        Some(username) => {
                            users.insert((username.as_str(), group.group.name.as_str()));
                        }
                        None => tracing::debug!(
                            dataset,
                            member = %member,
                            "no batch username, skipping"
                        ),
                    }
                }
            }
            let mut added = BTreeSet::new();
            for (username, group) in users {
                if !added.insert(username) {
                    continue;
                }
                if let Err(e) = self.add_user(dataset, username) {
                    errors.push(GroupPushError::new(group, format!("{username}: {e}")));
                }
            }
        }
        errors
    }
}
