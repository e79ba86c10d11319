mod common;

use brokerd::driver;
use common::*;

#[test]
fn disconnect_releases_names_and_announces_it() {
    let (mut bus, _, _) = new_bus();
    let (observer, observer_q) = add_peer(&mut bus, 16);
    register(&mut bus, observer, &observer_q);
    dispatch_ok(&mut bus, observer, driver_call(None, "AddMatch", 2, &("type='signal'",)));
    observer_q.drain();

    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);
    dispatch_ok(&mut bus, a, driver_call(None, "RequestName", 2, &("com.example.S", 0u32)));
    observer_q.drain();

    bus.remove_peer(a).unwrap();
    let address = format!(":1.{a}");

    // First the name is released, then the peer itself disappears.
    let changed = expect_signal(&observer_q, "NameOwnerChanged");
    let (name, old, new): (String, String, String) = changed.body().unwrap();
    assert_eq!((name.as_str(), old.as_str(), new.as_str()), ("com.example.S", address.as_str(), ""));

    let changed = expect_signal(&observer_q, "NameOwnerChanged");
    let (name, old, new): (String, String, String) = changed.body().unwrap();
    assert_eq!(
        (name.as_str(), old.as_str(), new.as_str()),
        (address.as_str(), address.as_str(), "")
    );

    assert_eq!(bus.names().lookup("com.example.S"), None);
    assert!(bus.peers().get(a).is_none());
}

#[test]
fn disconnect_fails_outstanding_replies() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    let (b, b_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);
    register(&mut bus, b, &b_q);

    dispatch_ok(
        &mut bus,
        a,
        method_call(
            Some(format!(":1.{b}").as_str()),
            "/",
            Some("com.example.Iface"),
            "Frob",
            5,
            &(),
        ),
    );
    assert_eq!(b_q.len(), 1);

    bus.remove_peer(b).unwrap();

    let text = expect_error(&a_q, "org.freedesktop.DBus.Error.NoReply");
    assert_eq!(text, "Remote peer disconnected");
}

#[test]
fn goodbye_is_idempotent() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);
    dispatch_ok(&mut bus, a, driver_call(None, "RequestName", 2, &("com.example.S", 0u32)));
    a_q.drain();

    driver::goodbye(&mut bus, a, false).unwrap();
    driver::goodbye(&mut bus, a, false).unwrap();
    bus.remove_peer(a).unwrap();
    bus.remove_peer(a).unwrap();
}

#[test]
fn unregistered_peers_vanish_quietly() {
    let (mut bus, _, _) = new_bus();
    let (observer, observer_q) = add_peer(&mut bus, 16);
    register(&mut bus, observer, &observer_q);
    dispatch_ok(&mut bus, observer, driver_call(None, "AddMatch", 2, &("type='signal'",)));
    observer_q.drain();

    // Never said Hello, nobody gets to know it was there.
    let (a, _a_q) = add_peer(&mut bus, 16);
    bus.remove_peer(a).unwrap();
    assert!(observer_q.pop().is_none());
}

#[test]
fn lists_shrink_after_disconnect() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    let (b, b_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);
    register(&mut bus, b, &b_q);
    dispatch_ok(&mut bus, b, driver_call(None, "RequestName", 2, &("com.example.S", 0u32)));
    b_q.drain();

    bus.remove_peer(b).unwrap();

    dispatch_ok(&mut bus, a, driver_call(None, "ListNames", 3, &()));
    let names: Vec<String> = expect_reply(&a_q).body().unwrap();
    assert!(!names.contains(&format!(":1.{b}")));
    assert!(!names.contains(&"com.example.S".to_string()));

    dispatch_ok(&mut bus, a, driver_call(None, "NameHasOwner", 4, &(format!(":1.{b}").as_str(),)));
    let has: bool = expect_reply(&a_q).body().unwrap();
    assert!(!has);
}
