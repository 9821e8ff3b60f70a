use super::*;

fn user(name: &str) -> UserName {
    UserName::new(name)
}

fn group(id: &str, members: &[&str], admins: &[&str]) -> GroupSummary {
    GroupSummary {
        id: GroupId::new(id),
        name: format!("{id} chat"),
        members: members.iter().map(UserName::new).collect(),
        admins: admins.iter().map(UserName::new).collect(),
        banned: BTreeSet::new(),
        created_at: None,
    }
}

fn directory_with(groups: Vec<GroupSummary>) -> ConversationDirectory {
    let mut directory = ConversationDirectory::new(user("alice"));
    directory.replace_groups(groups);
    directory
}

#[test]
fn group_events_replace_or_remove_only_the_affected_record() {
    let mut directory = directory_with(vec![
        group("g1", &["alice", "bob"], &["alice"]),
        group("g2", &["alice", "carol"], &["carol"]),
    ]);

    let change = directory.apply_group_event(&ServerEvent::GroupUpdated {
        group: group("g1", &["alice", "bob", "dave"], &["alice", "bob"]),
    });

    assert_eq!(change, Some(DirectoryChange::GroupUpserted(GroupId::new("g1"))));
    assert!(directory.is_member(&GroupId::new("g1"), &user("dave")));
    assert!(directory.is_admin(&GroupId::new("g1"), &user("bob")));
    assert_eq!(
        directory.group(&GroupId::new("g2")),
        Some(&group("g2", &["alice", "carol"], &["carol"]))
    );

    let change = directory.apply_group_event(&ServerEvent::GroupRemoved {
        group_id: GroupId::new("G2"),
    });
    assert_eq!(change, Some(DirectoryChange::GroupDropped(GroupId::new("g2"))));
    assert_eq!(directory.groups().count(), 1);
}

#[test]
fn created_and_added_groups_are_upserted_with_normalized_roles() {
    let mut directory = directory_with(Vec::new());
    let mut incoming = group("g3", &["alice", "bob"], &["alice", "mallory"]);
    incoming.banned.insert(user("bob"));

    directory.apply_group_event(&ServerEvent::GroupAdded { group: incoming });

    let stored = directory.group(&GroupId::new("g3")).expect("group stored");
    assert!(!stored.admins.contains(&user("mallory")));
    assert!(stored.banned.is_empty());

    directory.apply_group_event(&ServerEvent::GroupCreated {
        group: group("g4", &["alice"], &["alice"]),
    });
    assert_eq!(directory.groups().count(), 2);
}

#[test]
fn exiting_an_unknown_group_changes_nothing() {
    let mut directory = directory_with(vec![group("g1", &["alice"], &["alice"])]);

    let change = directory.apply_group_event(&ServerEvent::GroupExited {
        group_id: GroupId::new("missing"),
    });

    assert_eq!(change, None);
    assert_eq!(directory.groups().count(), 1);
}

#[test]
fn non_directory_events_are_ignored() {
    let mut directory = directory_with(Vec::new());
    let like = ServerEvent::LikeUpdate {
        message_id: "65a1b2c3d4e5f60718293a4b".to_string(),
        likes: Vec::new(),
    };

    assert_eq!(directory.apply_group_event(&like), None);
    assert!(!directory.apply_presence_event(&like));
}

#[test]
fn presence_is_replaced_wholesale_then_updated_incrementally() {
    let mut directory = directory_with(Vec::new());

    assert!(directory.apply_presence_event(&ServerEvent::InitialStatus {
        online_users: vec![user("Bob"), user("carol")],
    }));
    assert!(directory.is_online(&user("bob")));

    assert!(directory.apply_presence_event(&ServerEvent::Status {
        user_id: user("bob"),
        status: PresenceStatus::Offline,
    }));
    assert!(directory.apply_presence_event(&ServerEvent::Status {
        user_id: user("dave"),
        status: PresenceStatus::Online,
    }));
    assert!(!directory.apply_presence_event(&ServerEvent::Status {
        user_id: user("dave"),
        status: PresenceStatus::Online,
    }));

    let online: Vec<&str> = directory.online_users().map(UserName::as_str).collect();
    assert_eq!(online, vec!["carol", "dave"]);

    assert!(directory.apply_presence_event(&ServerEvent::InitialStatus {
        online_users: vec![user("erin")],
    }));
    assert!(!directory.is_online(&user("carol")));
}

#[test]
fn peers_exclude_the_current_user() {
    let mut directory = directory_with(Vec::new());
    directory.set_peers(vec![user("Alice"), user("bob"), user("")]);

    assert_eq!(directory.peers().collect::<Vec<_>>(), vec![&user("bob")]);
    assert!(!directory.note_peer(&user("alice")));
    assert!(!directory.note_peer(&user("bob")));
    assert!(directory.note_peer(&user("carol")));
    assert_eq!(directory.peers().count(), 2);
}

#[test]
fn create_group_includes_the_creator_once() {
    let directory = directory_with(Vec::new());

    let command = directory
        .create_group_command("  Team  ", vec![user("Bob"), user("alice"), user("bob")])
        .expect("command");

    assert_eq!(
        command,
        ClientCommand::CreateGroup {
            group_name: "Team".to_string(),
            creator: user("alice"),
            members: vec![user("alice"), user("bob")],
        }
    );
}

#[test]
fn create_group_validates_name_and_members() {
    let directory = directory_with(Vec::new());

    assert_eq!(
        directory.create_group_command(" ", vec![user("bob")]),
        Err(ClientError::MissingGroupName)
    );
    assert_eq!(
        directory.create_group_command("solo", vec![user("alice")]),
        Err(ClientError::NoGroupMembers)
    );
}

#[test]
fn membership_commands_are_outbound_only() {
    let directory = directory_with(vec![group("g1", &["alice", "bob"], &["alice"])]);
    let before = directory.group(&GroupId::new("g1")).cloned();
    let g1 = GroupId::new("g1");

    assert_eq!(
        directory.add_member_command(&g1, &user("Carol")),
        Ok(ClientCommand::AddMember {
            group_id: g1.clone(),
            by: user("alice"),
            user_id: user("carol"),
        })
    );
    assert!(matches!(
        directory.remove_member_command(&g1, &user("bob")),
        Ok(ClientCommand::RemoveMember { .. })
    ));
    assert!(matches!(
        directory.promote_admin_command(&g1, &user("bob")),
        Ok(ClientCommand::PromoteAdmin { .. })
    ));
    assert_eq!(
        directory.exit_group_command(&g1),
        Ok(ClientCommand::ExitGroup {
            group_id: g1.clone(),
            user_id: user("alice"),
        })
    );

    assert_eq!(directory.group(&g1).cloned(), before);
}

#[test]
fn membership_commands_reject_unknown_groups_and_empty_users() {
    let directory = directory_with(vec![group("g1", &["alice"], &["alice"])]);

    assert_eq!(
        directory.exit_group_command(&GroupId::new("nope")),
        Err(ClientError::UnknownGroup("nope".to_string()))
    );
    assert_eq!(
        directory.add_member_command(&GroupId::new("g1"), &user("  ")),
        Err(ClientError::InvalidIdentifier(String::new()))
    );
}
