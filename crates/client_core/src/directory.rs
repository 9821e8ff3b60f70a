use std::collections::{BTreeMap, BTreeSet};

use shared::{
    domain::{GroupId, UserName},
    protocol::{ClientCommand, GroupSummary, PresenceStatus, ServerEvent},
};
use tracing::{debug, info};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    GroupUpserted(GroupId),
    GroupDropped(GroupId),
}

/// Known peers, groups and presence for the signed-in user.
///
/// Group records change only through confirming server events; the
/// command builders below never touch local state.
#[derive(Debug, Clone)]
pub struct ConversationDirectory {
    current_user: UserName,
    groups: BTreeMap<GroupId, GroupSummary>,
    peers: BTreeSet<UserName>,
    online: BTreeSet<UserName>,
}

impl ConversationDirectory {
    pub fn new(current_user: UserName) -> Self {
        Self {
            current_user,
            groups: BTreeMap::new(),
            peers: BTreeSet::new(),
            online: BTreeSet::new(),
        }
    }

    pub fn current_user(&self) -> &UserName {
        &self.current_user
    }

    pub fn apply_group_event(&mut self, event: &ServerEvent) -> Option<DirectoryChange> {
        match event {
            ServerEvent::GroupCreated { group }
            | ServerEvent::GroupAdded { group }
            | ServerEvent::GroupUpdated { group } => {
                let group = group.clone().normalized();
                let id = group.id.clone();
                info!(group_id = %id, event = event.name(), "directory: group upserted");
                self.groups.insert(id.clone(), group);
                Some(DirectoryChange::GroupUpserted(id))
            }
            ServerEvent::GroupRemoved { group_id } | ServerEvent::GroupExited { group_id } => {
                let removed = self.groups.remove(group_id)?;
                info!(group_id = %removed.id, event = event.name(), "directory: group dropped");
                Some(DirectoryChange::GroupDropped(removed.id))
            }
            _ => None,
        }
    }

    /// Returns whether the presence set changed.
    pub fn apply_presence_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::InitialStatus { online_users } => {
                let next: BTreeSet<UserName> = online_users
                    .iter()
                    .filter(|user| !user.is_empty())
                    .cloned()
                    .collect();
                let changed = next != self.online;
                self.online = next;
                debug!(online = self.online.len(), "directory: presence replaced");
                changed
            }
            ServerEvent::Status { user_id, status } => match status {
                PresenceStatus::Online => self.online.insert(user_id.clone()),
                PresenceStatus::Offline => self.online.remove(user_id),
            },
            _ => false,
        }
    }

    pub fn replace_groups(&mut self, groups: Vec<GroupSummary>) {
        self.groups = groups
            .into_iter()
            .map(|group| {
                let group = group.normalized();
                (group.id.clone(), group)
            })
            .collect();
    }

    /// Replaces the peer list; the current user is never its own peer.
    pub fn set_peers(&mut self, users: impl IntoIterator<Item = UserName>) {
        let current_user = self.current_user.clone();
        self.peers = users
            .into_iter()
            .filter(|user| !user.is_empty() && *user != current_user)
            .collect();
    }

    /// Records a peer learned from a direct message. Returns whether it was new.
    pub fn note_peer(&mut self, user: &UserName) -> bool {
        if user.is_empty() || *user == self.current_user {
            return false;
        }
        self.peers.insert(user.clone())
    }

    pub fn peers(&self) -> impl Iterator<Item = &UserName> {
        self.peers.iter()
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSummary> {
        self.groups.values()
    }

    pub fn group(&self, id: &GroupId) -> Option<&GroupSummary> {
        self.groups.get(id)
    }

    pub fn is_member(&self, id: &GroupId, user: &UserName) -> bool {
        self.groups
            .get(id)
            .is_some_and(|group| group.members.contains(user))
    }

    pub fn is_admin(&self, id: &GroupId, user: &UserName) -> bool {
        self.groups
            .get(id)
            .is_some_and(|group| group.admins.contains(user))
    }

    pub fn is_online(&self, user: &UserName) -> bool {
        self.online.contains(user)
    }

    pub fn online_users(&self) -> impl Iterator<Item = &UserName> {
        self.online.iter()
    }

    pub fn create_group_command(
        &self,
        name: &str,
        members: impl IntoIterator<Item = UserName>,
    ) -> Result<ClientCommand, ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::MissingGroupName);
        }
        let mut members: BTreeSet<UserName> = members
            .into_iter()
            .filter(|user| !user.is_empty() && *user != self.current_user)
            .collect();
        if members.is_empty() {
            return Err(ClientError::NoGroupMembers);
        }
        members.insert(self.current_user.clone());
        Ok(ClientCommand::CreateGroup {
            group_name: name.to_string(),
            creator: self.current_user.clone(),
            members: members.into_iter().collect(),
        })
    }

    pub fn add_member_command(
        &self,
        group_id: &GroupId,
        user: &UserName,
    ) -> Result<ClientCommand, ClientError> {
        self.require_group(group_id)?;
        Ok(ClientCommand::AddMember {
            group_id: group_id.clone(),
            by: self.current_user.clone(),
            user_id: require_user(user)?,
        })
    }

    pub fn remove_member_command(
        &self,
        group_id: &GroupId,
        user: &UserName,
    ) -> Result<ClientCommand, ClientError> {
        self.require_group(group_id)?;
        Ok(ClientCommand::RemoveMember {
            group_id: group_id.clone(),
            by: self.current_user.clone(),
            user_id: require_user(user)?,
        })
    }

    pub fn promote_admin_command(
        &self,
        group_id: &GroupId,
        user: &UserName,
    ) -> Result<ClientCommand, ClientError> {
        self.require_group(group_id)?;
        Ok(ClientCommand::PromoteAdmin {
            group_id: group_id.clone(),
            by: self.current_user.clone(),
            user_id: require_user(user)?,
        })
    }

    pub fn exit_group_command(&self, group_id: &GroupId) -> Result<ClientCommand, ClientError> {
        self.require_group(group_id)?;
        Ok(ClientCommand::ExitGroup {
            group_id: group_id.clone(),
            user_id: self.current_user.clone(),
        })
    }

    fn require_group(&self, group_id: &GroupId) -> Result<(), ClientError> {
        if self.groups.contains_key(group_id) {
            Ok(())
        } else {
            Err(ClientError::UnknownGroup(group_id.to_string()))
        }
    }
}

fn require_user(user: &UserName) -> Result<UserName, ClientError> {
    if user.is_empty() {
        return Err(ClientError::InvalidIdentifier(user.to_string()));
    }
    Ok(user.clone())
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
