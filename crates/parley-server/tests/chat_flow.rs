//! Registration, presence, chat routing and operator commands, driven through
//! the full `ServerDriver` over in-memory sockets.

mod support;

use parley_proto::frame::MAX_LONG_MESSAGE_SIZE;
use parley_server::{AdminCommand, BanTarget, DriverConfig, LOBBY, ServerEvent};
use support::{Harness, closed};

#[test]
fn registration_replies_with_name_and_user_list() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    let carol = h.connect();
    h.send(&carol, "!register:username=carol");

    assert_eq!(carol.messages(), vec![
        "!regreply:username=carol".to_string(),
        "!userlist=bob,carol".to_string(),
        "!joinedgroup=lobby".to_string(),
    ]);
    assert_eq!(bob.messages(), vec![
        "!useronline=carol".to_string(),
        "!groupjoined=lobby,user=carol".to_string(),
    ]);
}

#[test]
fn taken_names_get_a_numeric_suffix() {
    let mut h = Harness::new();
    h.register("alice");

    let second = h.connect();
    h.send(&second, "!register:username=alice");
    assert_eq!(second.messages().first().map(String::as_str), Some("!regreply:username=alice_1"));

    let third = h.connect();
    h.send(&third, "!register:username=alice");
    assert_eq!(third.messages().first().map(String::as_str), Some("!regreply:username=alice_2"));

    assert_eq!(h.driver.registry().usernames(), vec!["alice", "alice_1", "alice_2"]);
}

#[test]
fn suffix_that_overflows_the_name_limit_is_refused() {
    let mut h = Harness::new();
    let long = "n".repeat(31);
    h.register(&long);

    let second = h.connect();
    let actions = h.send(&second, &format!("!register:username={long}"));

    assert_eq!(second.messages(), vec![format!("!err=NameExhausted,{long}")]);
    assert!(closed(&actions, second.conn));
}

#[test]
fn commands_before_registration_are_refused() {
    let mut h = Harness::new();
    let anon = h.connect();

    h.send(&anon, "@bob hi");
    h.send(&anon, "!joingroup=lobby");
    assert_eq!(anon.messages(), vec!["!err=NotRegistered".to_string(); 2]);
    assert_eq!(h.driver.connection_count(), 1);
}

#[test]
fn second_registration_is_refused_without_closing() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    let actions = h.send(&bob, "!register:username=robert");
    assert_eq!(bob.messages(), vec!["!err=AlreadyRegistered".to_string()]);
    assert!(!closed(&actions, bob.conn));
    assert!(h.driver.registry().is_online("bob"));
}

#[test]
fn direct_messages_reach_only_the_recipient() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    let dave = h.register("dave");
    bob.messages();
    carol.messages();

    h.send(&bob, "@carol lunch?");
    assert_eq!(carol.messages(), vec!["!privmsg=bob lunch?".to_string()]);
    assert!(dave.messages().is_empty());
    assert!(bob.messages().is_empty());

    h.send(&bob, "@zed anyone?");
    assert_eq!(bob.messages(), vec!["!err=UserNotFound,zed".to_string()]);
}

#[test]
fn public_messages_reach_everyone_but_the_sender() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    let dave = h.register("dave");
    bob.messages();
    carol.messages();

    h.send(&bob, "hello all");
    assert!(bob.messages().is_empty());
    assert_eq!(carol.messages(), vec!["!pubmsg=bob hello all".to_string()]);
    assert_eq!(dave.messages(), vec!["!pubmsg=bob hello all".to_string()]);
}

#[test]
fn disconnect_announces_offline_and_frees_the_name() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    let actions = h.hangup(&carol);
    assert!(closed(&actions, carol.conn));

    let notices = bob.messages();
    assert!(notices.contains(&"!useroffline=carol".to_string()));
    assert!(notices.contains(&"!leftgroup=lobby,user=carol".to_string()));
    assert!(!h.driver.groups().group(LOBBY).unwrap().is_joined("carol"));

    let again = h.connect();
    h.send(&again, "!register:username=carol");
    assert_eq!(again.messages().first().map(String::as_str), Some("!regreply:username=carol"));
}

#[test]
fn close_command_disconnects() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    let actions = h.send(&bob, "!close");
    assert!(closed(&actions, bob.conn));
    assert_eq!(h.driver.connection_count(), 0);
    assert!(bob.peer.is_dropped());
}

#[test]
fn bad_frames_and_commands_get_error_replies() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    let actions = h.send_raw(&bob, &[0x00, 0x00, 0x00, 0x01]);
    assert!(!closed(&actions, bob.conn));
    assert_eq!(bob.messages(), vec!["!err=BadFrame".to_string()]);

    h.send(&bob, "!frobnicate");
    assert_eq!(bob.messages(), vec!["!err=BadCommand,unknown command: frobnicate".to_string()]);

    h.send(&bob, "!userlist");
    assert_eq!(bob.messages(), vec!["!userlist=bob".to_string()]);
}

#[test]
fn slow_reader_is_dropped_when_its_outbox_overflows() {
    let mut h = Harness::with_config(DriverConfig { outbox_capacity: 2, ..DriverConfig::default() });
    let bob = h.register("bob");
    let carol = h.register("carol");
    carol.messages();

    bob.peer.set_write_budget(Some(0));
    for n in 0..4 {
        h.send(&carol, &format!("message {n}"));
    }

    assert!(!h.driver.registry().is_online("bob"));
    assert!(carol.messages().contains(&"!useroffline=bob".to_string()));
}

#[test]
fn operator_broadcast_and_lobby_message() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    h.process(ServerEvent::Admin(AdminCommand::Broadcast("restart at noon".into())));
    assert_eq!(bob.messages(), vec!["!adminmsg=restart at noon".to_string()]);
    assert_eq!(carol.messages(), vec!["!adminmsg=restart at noon".to_string()]);

    h.process(ServerEvent::Admin(AdminCommand::LobbyMessage("welcome".into())));
    assert_eq!(bob.messages(), vec!["!groupmsg=lobby,admin welcome".to_string()]);
}

#[test]
fn operator_promote_and_demote() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    h.process(ServerEvent::Admin(AdminCommand::Promote("bob".into())));
    assert_eq!(bob.messages(), vec!["!promoted".to_string()]);
    assert!(h.driver.registry().user(bob.conn).unwrap().admin);

    h.process(ServerEvent::Admin(AdminCommand::Demote("bob".into())));
    assert_eq!(bob.messages(), vec!["!demoted".to_string()]);
    assert!(!h.driver.registry().user(bob.conn).unwrap().admin);
}

#[test]
fn operator_drop_user() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    let actions = h.process(ServerEvent::Admin(AdminCommand::DropUser("bob".into())));
    assert!(closed(&actions, bob.conn));
    assert!(!h.driver.registry().is_online("bob"));
}

#[test]
fn ban_by_user_name_drops_and_refuses_the_address() {
    let mut h = Harness::new();
    let (bob, _) = h.connect_from(9);
    h.send(&bob, "!register:username=bob");
    let (lurker, _) = h.connect_from(9);

    let actions = h.process(ServerEvent::Admin(AdminCommand::Ban(BanTarget::new("bob"))));
    assert!(closed(&actions, bob.conn));
    assert!(closed(&actions, lurker.conn));

    let (retry, actions) = h.connect_from(9);
    assert!(closed(&actions, retry.conn));
    assert_eq!(h.driver.connection_count(), 0);

    h.process(ServerEvent::Admin(AdminCommand::Unban(BanTarget::new("10.0.0.9"))));
    let (back, actions) = h.connect_from(9);
    assert!(!closed(&actions, back.conn));
    assert_eq!(h.driver.connection_count(), 1);
}

#[test]
fn chat_too_long_to_frame_is_refused_to_the_sender() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    // Fits inbound, but the `!privmsg=carol ` prefix pushes it past the limit.
    let text = "x".repeat(MAX_LONG_MESSAGE_SIZE - "@bob ".len());
    let actions = h.send(&carol, &format!("@bob {text}"));
    assert_eq!(carol.messages(), vec!["!err=BadCommand,message too long".to_string()]);
    assert!(bob.messages().is_empty());
    assert!(!closed(&actions, carol.conn));

    h.send(&carol, "@bob hi");
    assert_eq!(bob.messages(), vec!["!privmsg=carol hi".to_string()]);
}
