#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use brokerd::{
    bus::{ActivationLauncher, BrokerParent, Bus, ForwardError},
    connection::{Connection, EnqueueError, MessageQueue},
    driver::{self, Disposition},
    peer::PeerCredentials,
    policy::PolicySnapshot,
};
use nix::unistd::Uid;
use zbus::{
    zvariant::{self, DynamicType, EncodingContext},
    Message, MessageBuilder, MessageHeader, MessageType,
};

#[derive(Debug)]
struct QueueInner {
    messages: Mutex<VecDeque<Arc<Message>>>,
    capacity: usize,
    closed: AtomicBool,
}

/// In-memory connection queue; the handle side lets tests inspect what the
/// driver sent.
#[derive(Debug)]
pub struct TestQueue(Arc<QueueInner>);

#[derive(Debug, Clone)]
pub struct QueueHandle(Arc<QueueInner>);

impl MessageQueue for TestQueue {
    fn enqueue(&self, msg: Arc<Message>) -> Result<(), EnqueueError> {
        if self.0.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut messages = self.0.messages.lock().unwrap();
        if messages.len() >= self.0.capacity {
            return Err(EnqueueError::Quota);
        }
        messages.push_back(msg);

        Ok(())
    }

    fn shutdown(&self) {
        self.0.closed.store(true, Ordering::Relaxed);
    }
}

impl QueueHandle {
    pub fn pop(&self) -> Option<Arc<Message>> {
        self.0.messages.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.0.messages.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.0.messages.lock().unwrap().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.closed.load(Ordering::Relaxed)
    }
}

pub fn test_queue(capacity: usize) -> (Connection, QueueHandle) {
    let inner = Arc::new(QueueInner {
        messages: Mutex::new(VecDeque::new()),
        capacity,
        closed: AtomicBool::new(false),
    });

    (
        Connection::new(Box::new(TestQueue(inner.clone()))),
        QueueHandle(inner),
    )
}

#[derive(Debug, Default)]
pub struct ParentInner {
    pub env: Mutex<Vec<(String, String)>>,
    pub reloads: Mutex<Vec<(u64, u32)>>,
    pub fail: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct ParentHandle(pub Arc<ParentInner>);

#[derive(Debug)]
struct TestParent(Arc<ParentInner>);

impl BrokerParent for TestParent {
    fn update_environment(&self, env: &[(String, String)]) -> Result<(), ForwardError> {
        if self.0.fail.load(Ordering::Relaxed) {
            return Err(ForwardError);
        }
        self.0.env.lock().unwrap().extend(env.iter().cloned());

        Ok(())
    }

    fn reload_config(&self, sender_id: u64, serial: u32) -> Result<(), ForwardError> {
        if self.0.fail.load(Ordering::Relaxed) {
            return Err(ForwardError);
        }
        self.0.reloads.lock().unwrap().push((sender_id, serial));

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LauncherInner {
    pub launched: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct LauncherHandle(pub Arc<LauncherInner>);

#[derive(Debug)]
struct TestLauncher(Arc<LauncherInner>);

impl ActivationLauncher for TestLauncher {
    fn launch(&self, name: &str) {
        self.0.launched.lock().unwrap().push(name.to_string());
    }
}

pub const MACHINE_ID: &str = "69705ab2b7674f4e8d6b0a4c489e5d91";

pub fn new_bus() -> (Bus, ParentHandle, LauncherHandle) {
    brokerd::tracing_subscriber::init();

    let parent = Arc::new(ParentInner::default());
    let launcher = Arc::new(LauncherInner::default());
    let bus = Bus::new(
        MACHINE_ID,
        Box::new(TestParent(parent.clone())),
        Box::new(TestLauncher(launcher.clone())),
    );

    (bus, ParentHandle(parent), LauncherHandle(launcher))
}

pub fn creds(uid: u32) -> PeerCredentials {
    PeerCredentials {
        uid: Uid::from_raw(uid),
        pid: 4321,
        seclabel: None,
    }
}

pub fn add_peer(bus: &mut Bus, capacity: usize) -> (u64, QueueHandle) {
    add_peer_with(bus, capacity, creds(1000), PolicySnapshot::allow_all())
}

pub fn add_privileged_peer(bus: &mut Bus, capacity: usize) -> (u64, QueueHandle) {
    let uid = bus.uid().as_raw();
    add_peer_with(bus, capacity, creds(uid), PolicySnapshot::allow_all())
}

pub fn add_peer_with(
    bus: &mut Bus,
    capacity: usize,
    creds: PeerCredentials,
    policy: PolicySnapshot,
) -> (u64, QueueHandle) {
    let (conn, handle) = test_queue(capacity);

    (bus.add_peer(conn, creds, policy), handle)
}

/// Rebuild the message with the given serial number stamped into its
/// primary header, the way the wire would have delivered it.
pub fn with_serial(msg: Message, serial: u32) -> Message {
    let mut bytes = msg.as_bytes().to_vec();
    bytes[8..12].copy_from_slice(&serial.to_ne_bytes());

    let ctxt = EncodingContext::<byteorder::NativeEndian>::new_dbus(0);
    let header: MessageHeader<'_> = zvariant::from_slice(&bytes, ctxt).unwrap();
    let signature = match header.signature().unwrap() {
        Some(signature) => signature.clone(),
        None => <() as zvariant::Type>::signature(),
    };
    let body = msg.body_as_bytes().unwrap();
    let builder = MessageBuilder::from(header.clone());

    unsafe {
        builder
            .build_raw_body(
                body,
                signature,
                #[cfg(unix)]
                vec![],
            )
            .unwrap()
    }
}

/// A method call as a peer would send it (sender left for the driver to
/// stitch in).
pub fn method_call<B>(
    destination: Option<&str>,
    path: &str,
    interface: Option<&str>,
    member: &str,
    serial: u32,
    body: &B,
) -> Arc<Message>
where
    B: serde::ser::Serialize + DynamicType,
{
    let mut builder = MessageBuilder::method_call(path, member).unwrap();
    if let Some(destination) = destination {
        builder = builder.destination(destination).unwrap();
    }
    if let Some(interface) = interface {
        builder = builder.interface(interface).unwrap();
    }
    let msg = builder.build(body).unwrap();

    Arc::new(with_serial(msg, serial))
}

/// Shorthand for calls on the driver itself.
pub fn driver_call<B>(interface: Option<&str>, member: &str, serial: u32, body: &B) -> Arc<Message>
where
    B: serde::ser::Serialize + DynamicType,
{
    method_call(
        Some("org.freedesktop.DBus"),
        "/org/freedesktop/DBus",
        interface,
        member,
        serial,
        body,
    )
}

pub fn signal<B>(path: &str, interface: &str, member: &str, body: &B) -> Arc<Message>
where
    B: serde::ser::Serialize + DynamicType,
{
    Arc::new(
        MessageBuilder::signal(path, interface, member)
            .unwrap()
            .build(body)
            .unwrap(),
    )
}

pub fn dispatch_ok(bus: &mut Bus, peer_id: u64, msg: Arc<Message>) {
    assert_eq!(
        driver::dispatch(bus, peer_id, msg).unwrap(),
        Disposition::Continue
    );
}

/// Say `Hello` for the peer and discard the driver's responses.
pub fn register(bus: &mut Bus, peer_id: u64, queue: &QueueHandle) {
    dispatch_ok(bus, peer_id, driver_call(None, "Hello", 1, &()));
    let replies = queue.drain();
    assert!(
        matches!(replies.first(), Some(m) if m.message_type() == MessageType::MethodReturn),
        "Hello must be answered first"
    );
}

pub fn error_name_of(msg: &Message) -> Option<String> {
    msg.header()
        .unwrap()
        .error_name()
        .unwrap()
        .map(|e| e.to_string())
}

pub fn member_of(msg: &Message) -> Option<String> {
    msg.header()
        .unwrap()
        .member()
        .unwrap()
        .map(|m| m.to_string())
}

pub fn destination_of(msg: &Message) -> Option<String> {
    msg.header()
        .unwrap()
        .destination()
        .unwrap()
        .map(|d| d.to_string())
}

pub fn sender_of(msg: &Message) -> Option<String> {
    msg.header()
        .unwrap()
        .sender()
        .unwrap()
        .map(|s| s.to_string())
}

/// Pop the next queued message and require a method return.
pub fn expect_reply(queue: &QueueHandle) -> Arc<Message> {
    let msg = queue.pop().expect("expected a method return");
    assert_eq!(msg.message_type(), MessageType::MethodReturn);

    msg
}

/// Pop the next queued message and require an error with the given name;
/// returns the error text.
pub fn expect_error(queue: &QueueHandle, name: &str) -> String {
    let msg = queue.pop().expect("expected an error");
    assert_eq!(msg.message_type(), MessageType::Error, "got {msg:?}");
    assert_eq!(error_name_of(&msg).as_deref(), Some(name));

    msg.body().unwrap()
}

/// Pop the next queued message and require the named signal.
pub fn expect_signal(queue: &QueueHandle, member: &str) -> Arc<Message> {
    let msg = queue.pop().expect("expected a signal");
    assert_eq!(msg.message_type(), MessageType::Signal, "got {msg:?}");
    assert_eq!(member_of(&msg).as_deref(), Some(member));

    msg
}
