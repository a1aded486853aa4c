//! File offers, relay channels and group uploads/downloads through the
//! driver.

mod support;

use std::time::Duration;

use rand::RngCore;
use support::{Client, Harness, closed, crc_hex, token_of};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn claim(kind: &str, file: &str, data: &[u8], sender: &str, receiver: &str, token: &str) -> String {
    format!(
        "!{kind}={file},size={},crc={},sender={sender},receiver={receiver},token={token}",
        data.len(),
        crc_hex(data)
    )
}

/// bob offers `data` to carol and carol accepts. Returns the token.
fn agreed_offer(h: &mut Harness, bob: &Client, carol: &Client, data: &[u8]) -> String {
    let crc = crc_hex(data);
    h.send(bob, &format!("!sendfile=data.bin,size={},crc={crc},target=carol", data.len()));
    let offer = carol.expect("!sendfile=");
    let token = token_of(&offer);

    h.send(carol, &format!(
        "!acceptfile=data.bin,size={},crc={crc},sender=bob,token={token}",
        data.len()
    ));
    token
}

#[test]
fn offer_reaches_target_and_acknowledges_sender() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    h.send(&bob, "!sendfile=report.txt,size=1024,crc=0xabc1234,target=carol");

    let offer = carol.messages();
    assert_eq!(offer.len(), 1);
    assert!(offer[0].starts_with("!sendfile=report.txt,size=1024,crc=0xabc1234,sender=bob,token="));
    let token = token_of(&offer[0]);
    assert_eq!(token.len(), 16);
    assert_eq!(bob.messages(), vec![format!("!sendfileok=report.txt,target=carol,token={token}")]);
}

#[test]
fn offer_without_target_or_to_self_is_refused() {
    let mut h = Harness::new();
    let bob = h.register("bob");

    h.send(&bob, "!sendfile=a.txt,size=1,crc=0x1");
    assert_eq!(bob.messages(), vec!["!err=BadCommand,missing target".to_string()]);

    h.send(&bob, "!sendfile=a.txt,size=1,crc=0x1,target=bob");
    assert_eq!(bob.messages(), vec!["!err=SelfTarget".to_string()]);
}

#[test]
fn accept_notifies_sender_and_reject_cancels() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    let data = b"hello".to_vec();
    let token = agreed_offer(&mut h, &bob, &carol, &data);
    let accepted = bob.expect("!acceptfile=");
    assert_eq!(
        accepted,
        format!("!acceptfile=data.bin,size=5,crc={},receiver=carol,token={token}", crc_hex(&data))
    );

    h.send(&bob, "!cancelfile=carol,reason=changed my mind");
    assert_eq!(carol.messages(), vec!["!cancelfile=bob,reason=changed my mind".to_string()]);
    assert!(h.driver.relay().state("bob").is_none());
    assert!(h.driver.relay().state("carol").is_none());

    h.send(&bob, "!sendfile=again.txt,size=3,crc=0x3,target=carol");
    carol.messages();
    h.send(&carol, "!rejectfile=bob,reason=busy");
    assert!(bob.messages().contains(&"!rejectfile=carol,reason=busy".to_string()));
    assert!(h.driver.relay().state("bob").is_none());
}

#[test]
fn one_transfer_per_user() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    let dave = h.register("dave");

    h.send(&bob, "!sendfile=a.txt,size=1,crc=0x1,target=carol");
    bob.messages();
    h.send(&bob, "!sendfile=b.txt,size=1,crc=0x1,target=dave");
    assert_eq!(bob.messages(), vec!["!err=TransferBusy,bob".to_string()]);

    h.send(&dave, "!sendfile=b.txt,size=1,crc=0x1,target=bob");
    assert_eq!(dave.messages(), vec!["!err=TransferBusy,bob".to_string()]);
    assert!(carol.messages().iter().all(|m| !m.contains("b.txt")));
}

#[test]
fn accept_with_wrong_token_is_refused() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    h.send(&bob, "!sendfile=a.txt,size=1,crc=0x1,target=carol");
    carol.messages();
    h.send(&carol, "!acceptfile=a.txt,size=1,crc=0x1,sender=bob,token=WRONG");
    assert_eq!(carol.messages(), vec!["!err=TokenMismatch".to_string()]);

    h.send(&carol, "!acceptfile=a.txt,size=1,crc=0x1,sender=dave,token=WRONG");
    assert_eq!(carol.messages(), vec!["!err=NoTransfer,dave".to_string()]);
}

#[test]
fn unanswered_offer_expires() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");
    bob.messages();

    h.send(&bob, "!sendfile=a.txt,size=1,crc=0x1,target=carol");
    bob.messages();
    carol.messages();

    h.elapse(Duration::from_secs(29));
    assert!(bob.messages().is_empty());
    assert!(h.driver.relay().state("bob").is_some());

    h.elapse(Duration::from_secs(2));
    assert_eq!(bob.messages(), vec!["!cancelfile=carol,reason=Expired".to_string()]);
    assert_eq!(carol.messages(), vec!["!cancelfile=bob,reason=Expired".to_string()]);
    assert!(h.driver.relay().state("bob").is_none());
}

#[test]
fn accepted_offer_does_not_expire() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    agreed_offer(&mut h, &bob, &carol, b"abc");
    bob.messages();
    carol.messages();

    h.elapse(Duration::from_secs(60));
    assert!(bob.messages().is_empty());
    assert!(carol.messages().is_empty());
    assert!(h.driver.relay().state("bob").is_some());
}

#[test]
fn bytes_are_relayed_between_channels() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    let data = random_bytes(40_000);
    let token = agreed_offer(&mut h, &bob, &carol, &data);

    let upload = h.connect();
    upload.peer.send_message(claim("xfersend", "data.bin", &data, "bob", "carol", &token).as_bytes());
    upload.peer.send_raw(&data);
    h.readable(&upload);

    let download = h.connect();
    h.send(&download, &claim("xferrecv", "data.bin", &data, "bob", "carol", &token));

    h.pump(&[&upload, &download]);

    assert_eq!(download.peer.take_raw(), data);
    assert_eq!(upload.peer.unread(), 0);

    h.hangup(&upload);
    assert!(download.peer.is_dropped());
    assert!(h.driver.relay().state("bob").is_none());
    assert!(h.driver.relay().state("carol").is_none());
    assert!(!bob.messages().iter().any(|m| m.starts_with("!cancelfile")));
    assert!(h.driver.registry().is_online("bob"));
}

#[test]
fn channel_claim_must_match_the_negotiated_transfer() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    let data = b"payload".to_vec();
    agreed_offer(&mut h, &bob, &carol, &data);

    let rogue = h.connect();
    let actions = h.send(&rogue, &claim("xfersend", "data.bin", &data, "bob", "carol", "FORGED"));
    assert_eq!(rogue.messages(), vec!["!err=TokenMismatch".to_string()]);
    assert!(closed(&actions, rogue.conn));
    assert!(h.driver.relay().state("bob").is_some());
}

#[test]
fn closing_a_channel_early_cancels_both_sides() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    let data = random_bytes(1000);
    let token = agreed_offer(&mut h, &bob, &carol, &data);
    bob.messages();
    carol.messages();

    let upload = h.connect();
    h.send(&upload, &claim("xfersend", "data.bin", &data, "bob", "carol", &token));
    h.hangup(&upload);

    assert_eq!(bob.messages(), vec!["!cancelfile=carol,reason=ChannelClosed".to_string()]);
    assert_eq!(carol.messages(), vec!["!cancelfile=bob,reason=ChannelClosed".to_string()]);
    assert!(h.driver.relay().channel_ids().is_empty());
}

#[test]
fn disconnecting_user_cancels_the_transfer() {
    let mut h = Harness::new();
    let bob = h.register("bob");
    let carol = h.register("carol");

    agreed_offer(&mut h, &bob, &carol, b"abc");
    bob.messages();

    h.hangup(&carol);
    let notices = bob.messages();
    assert_eq!(
        notices.iter().filter(|m| m.starts_with("!cancelfile=")).cloned().collect::<Vec<_>>(),
        vec!["!cancelfile=carol,reason=Disconnected".to_string()]
    );
    assert!(h.driver.relay().state("bob").is_none());
}

/// bob founds `team` with carol joined.
fn team(h: &mut Harness) -> (Client, Client) {
    let bob = h.register("bob");
    let carol = h.register("carol");
    h.send(&bob, "!newgroup=team,carol");
    h.send(&carol, "!joingroup=team");
    bob.messages();
    carol.messages();
    (bob, carol)
}

fn upload(h: &mut Harness, user: &Client, name: &str, file: &str, data: &[u8], crc: &str) {
    h.send(user, &format!("!putfile=team,file={file},size={},crc={crc}", data.len()));
    let token = token_of(&user.expect("!putfileok="));

    let channel = h.connect();
    let claim = format!(
        "!xfersend={file},size={},crc={crc},sender={name},receiver=team,token={token}",
        data.len()
    );
    channel.peer.send_message(claim.as_bytes());
    channel.peer.send_raw(data);
    h.readable(&channel);
    h.pump(&[&channel]);
}

#[test]
fn upload_is_verified_stored_and_announced() {
    let mut h = Harness::new();
    let (bob, carol) = team(&mut h);

    let data = random_bytes(50_000);
    upload(&mut h, &bob, "bob", "notes.txt", &data, &crc_hex(&data));

    let announce = "!newfile=team,id=1,file=notes.txt,size=50000,uploader=bob".to_string();
    assert_eq!(bob.messages(), vec![announce.clone()]);
    assert_eq!(carol.messages(), vec![announce]);
    assert_eq!(h.store.contents("team", "notes.txt"), Some(data));
    assert!(h.driver.relay().channel_ids().is_empty());

    h.send(&carol, "!filelist=team");
    assert_eq!(carol.messages(), vec!["!filelist=team 1:notes.txt:50000:bob".to_string()]);
}

#[test]
fn upload_with_wrong_checksum_is_discarded() {
    let mut h = Harness::new();
    let (bob, carol) = team(&mut h);

    let data = random_bytes(2_000);
    let wrong = format!("{:#x}", crc32fast::hash(&data).wrapping_add(1));
    upload(&mut h, &bob, "bob", "notes.txt", &data, &wrong);

    assert_eq!(bob.messages(), vec!["!err=ChecksumMismatch,notes.txt".to_string()]);
    assert!(carol.messages().is_empty());
    assert!(h.store.files("team").is_empty());
    assert!(h.driver.groups().group("team").unwrap().file(1).is_none());
}

#[test]
fn uploads_need_membership() {
    let mut h = Harness::new();
    let _ = team(&mut h);
    let dave = h.register("dave");

    h.send(&dave, "!putfile=team,file=x.txt,size=1,crc=0x1");
    assert_eq!(dave.messages(), vec!["!err=PermissionDenied,team".to_string()]);

    h.send(&dave, "!putfile=nowhere,file=x.txt,size=1,crc=0x1");
    assert_eq!(dave.messages(), vec!["!err=GroupNotFound,nowhere".to_string()]);
}

#[test]
fn stored_file_can_be_downloaded() {
    let mut h = Harness::new();
    let (bob, carol) = team(&mut h);

    let data = random_bytes(33_000);
    let crc = crc_hex(&data);
    upload(&mut h, &bob, "bob", "notes.txt", &data, &crc);
    carol.messages();

    h.send(&carol, "!getfile=team 1");
    let reply = carol.expect("!getfileok=");
    assert!(reply.starts_with(&format!("!getfileok=team,id=1,file=notes.txt,size=33000,crc={crc},token=")));
    let token = token_of(&reply);

    let channel = h.connect();
    h.send(&channel, &claim("xferrecv", "notes.txt", &data, "team", "carol", &token));
    h.pump(&[&channel]);
    assert_eq!(channel.peer.take_raw(), data);

    h.hangup(&channel);
    assert!(h.driver.relay().state("carol").is_none());
    assert!(carol.messages().is_empty());

    h.send(&carol, "!getfile=team 9");
    assert_eq!(carol.messages(), vec!["!err=FileNotFound,9".to_string()]);
}

#[test]
fn only_uploader_or_kicker_removes_files() {
    let mut h = Harness::new();
    let (bob, carol) = team(&mut h);

    let data = b"plan".to_vec();
    upload(&mut h, &bob, "bob", "plan.txt", &data, &crc_hex(&data));
    bob.messages();
    carol.messages();

    h.send(&carol, "!removefile=team,1");
    assert_eq!(carol.messages(), vec!["!err=PermissionDenied,team".to_string()]);

    h.send(&bob, "!removefile=team,1");
    assert_eq!(bob.messages(), vec!["!fileremoved=team,id=1".to_string()]);
    assert_eq!(carol.messages(), vec!["!fileremoved=team,id=1".to_string()]);
    assert!(h.store.contents("team", "plan.txt").is_none());

    h.send(&bob, "!removefile=team,1");
    assert_eq!(bob.messages(), vec!["!err=FileNotFound,1".to_string()]);
}
