use crate::cloud::CloudInfra;
use crate::groups::{GroupPushError, GroupTarget, MembershipSnapshot};
use crate::naming;
use std::sync::Arc;

/// Cloud-native groups on one cloud. Nested groups are pushed as members,
/// since both clouds resolve nesting themselves.
pub struct CloudGroupTarget {
    infra: Arc<dyn CloudInfra>,
    with_members: bool,
}

impl CloudGroupTarget {
    pub fn new(infra: Arc<dyn CloudInfra>) -> Self {
        Self {
            infra,
            with_members: true,
        }
    }

    /// Create the groups but leave them empty. Used while groups are being
    /// renamed, so old and new groups never grant access at the same time.
    pub fn without_members(mut self) -> Self {
        self.with_members = false;
        self
    }
}

impl GroupTarget for CloudGroupTarget {
    fn id(&self) -> String {
        format!("cloud-groups:{}", self.infra.name())
    }

    fn push(&self, snapshot: &MembershipSnapshot) -> Vec<GroupPushError> {
        let cloud = self.infra.name();
        let mut errors = Vec::new();
        for members in snapshot.for_cloud(cloud) {
            let group = &members.group;
            let key = naming::resource_key(&group.dataset, cloud, &format!("group-{}", group.kind));
            if let Err(e) = self.infra.create_group(&key, group) {
                errors.push(GroupPushError::new(group.name.clone(), e.to_string()));
                continue;
            }
            if !self.with_members {
                continue;
            }
            for member in &members.direct {
                let member_key = format!("{key}-{}", naming::external_sa_name(member.id()));
                if let Err(e) = self.infra.add_group_member(&member_key, group, member) {
                    errors.push(GroupPushError::new(group.name.clone(), e.to_string()));
                }
            }
        }
        errors
    }
}
