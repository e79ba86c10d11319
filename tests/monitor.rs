mod common;

use brokerd::driver::{self, Disposition};
use common::*;
use zbus::MessageType;

#[test]
fn become_monitor_requires_privileges() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);

    dispatch_ok(
        &mut bus,
        a,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            2,
            &(Vec::<String>::new(), 0u32),
        ),
    );
    let text = expect_error(&a_q, "org.freedesktop.DBus.Error.AccessDenied");
    assert_eq!(
        text,
        "The caller does not have the necessary privileged to call this method"
    );
}

#[test]
fn become_monitor_validates_input() {
    let (mut bus, _, _) = new_bus();
    let (m, m_q) = add_privileged_peer(&mut bus, 16);
    register(&mut bus, m, &m_q);

    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            2,
            &(Vec::<String>::new(), 7u32),
        ),
    );
    let text = expect_error(&m_q, "org.freedesktop.DBus.Error.InvalidArgs");
    assert_eq!(text, "Invalid flags");

    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(vec!["garbage".to_string()], 0u32),
        ),
    );
    expect_error(&m_q, "org.freedesktop.DBus.Error.MatchRuleInvalid");

    assert_eq!(bus.n_monitors(), 0);
}

#[test]
fn become_monitor_sheds_names_silently() {
    let (mut bus, _, _) = new_bus();
    let (observer, observer_q) = add_peer(&mut bus, 16);
    register(&mut bus, observer, &observer_q);
    dispatch_ok(&mut bus, observer, driver_call(None, "AddMatch", 2, &("type='signal'",)));
    observer_q.drain();

    let (m, m_q) = add_privileged_peer(&mut bus, 16);
    register(&mut bus, m, &m_q);
    dispatch_ok(&mut bus, m, driver_call(None, "RequestName", 2, &("com.example.M", 0u32)));
    m_q.drain();
    observer_q.drain();

    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(Vec::<String>::new(), 0u32),
        ),
    );

    // The method return is the last thing the connection sees as a peer.
    let reply = m_q.pop().expect("BecomeMonitor reply");
    assert_eq!(reply.message_type(), MessageType::MethodReturn);

    // No NameLost, no NameOwnerChanged: the transition is silent.
    assert!(observer_q.pop().is_none());
    assert_eq!(bus.names().lookup("com.example.M"), None);
    assert_eq!(bus.n_monitors(), 1);
}

#[test]
fn monitors_mirror_all_selected_traffic() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    let (b, b_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);
    register(&mut bus, b, &b_q);

    let (m, m_q) = add_privileged_peer(&mut bus, 32);
    register(&mut bus, m, &m_q);
    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(Vec::<String>::new(), 0u32),
        ),
    );
    m_q.drain();

    // A wildcard monitor sees a driver call and the driver's reply.
    dispatch_ok(&mut bus, a, driver_call(None, "ListNames", 4, &()));
    a_q.drain();
    let mirrored_call = m_q.pop().expect("mirrored method call");
    assert_eq!(member_of(&mirrored_call).as_deref(), Some("ListNames"));
    let mirrored_reply = m_q.pop().expect("mirrored reply");
    assert_eq!(mirrored_reply.message_type(), MessageType::MethodReturn);
    assert!(m_q.pop().is_none());

    // Unicast peer-to-peer traffic is mirrored once.
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
    let mirrored = m_q.pop().expect("mirrored unicast");
    assert_eq!(member_of(&mirrored).as_deref(), Some("Frob"));
    assert!(m_q.pop().is_none());

    // Broadcasts reach the monitor through its own match rules, once.
    dispatch_ok(&mut bus, a, signal("/", "com.example.Iface", "Changed", &()));
    let mirrored = m_q.pop().expect("mirrored broadcast");
    assert_eq!(member_of(&mirrored).as_deref(), Some("Changed"));
    assert!(m_q.pop().is_none());
}

#[test]
fn monitor_rules_filter_the_mirror() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);

    let (m, m_q) = add_privileged_peer(&mut bus, 16);
    register(&mut bus, m, &m_q);
    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(vec!["type='signal'".to_string()], 0u32),
        ),
    );
    m_q.drain();

    dispatch_ok(&mut bus, a, driver_call(None, "ListNames", 4, &()));
    a_q.drain();
    assert!(m_q.pop().is_none(), "method calls are not selected");

    dispatch_ok(&mut bus, a, signal("/", "com.example.Iface", "Changed", &()));
    expect_signal(&m_q, "Changed");
}

#[test]
fn monitors_may_not_send() {
    let (mut bus, _, _) = new_bus();
    let (m, m_q) = add_privileged_peer(&mut bus, 16);
    register(&mut bus, m, &m_q);
    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(Vec::<String>::new(), 0u32),
        ),
    );
    m_q.drain();

    assert_eq!(
        driver::dispatch(&mut bus, m, driver_call(None, "ListNames", 4, &())).unwrap(),
        Disposition::Disconnect
    );
}

#[test]
fn monitors_are_not_destinations() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);

    let (m, m_q) = add_privileged_peer(&mut bus, 16);
    register(&mut bus, m, &m_q);
    let monitor_address = format!(":1.{m}");
    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(Vec::<String>::new(), 0u32),
        ),
    );
    m_q.drain();

    dispatch_ok(
        &mut bus,
        a,
        method_call(
            Some(monitor_address.as_str()),
            "/",
            Some("com.example.Iface"),
            "Frob",
            4,
            &(),
        ),
    );
    expect_error(&a_q, "org.freedesktop.DBus.Error.ServiceUnknown");
}

#[test]
fn overloaded_monitor_is_disconnected() {
    let (mut bus, _, _) = new_bus();
    let (a, a_q) = add_peer(&mut bus, 16);
    register(&mut bus, a, &a_q);

    let (m, m_q) = add_privileged_peer(&mut bus, 2);
    register(&mut bus, m, &m_q);
    dispatch_ok(
        &mut bus,
        m,
        driver_call(
            Some("org.freedesktop.DBus.Monitoring"),
            "BecomeMonitor",
            3,
            &(Vec::<String>::new(), 0u32),
        ),
    );
    // The BecomeMonitor response takes one of the two slots, the first
    // mirrored broadcast the other; the next one overflows.
    assert_eq!(m_q.len(), 1);

    dispatch_ok(&mut bus, a, signal("/", "com.example.Iface", "Changed", &()));
    assert!(!m_q.is_shutdown());
    dispatch_ok(&mut bus, a, signal("/", "com.example.Iface", "Changed", &()));
    assert!(m_q.is_shutdown());
    // The broadcast itself still went through to its subscribers.
}
