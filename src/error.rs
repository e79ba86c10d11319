use thiserror::Error;

/// Everything that can go wrong while dispatching a message.
///
/// Each variant (except `Fatal` and `ProtocolViolation`) maps to exactly one
/// D-Bus error name, sent back to the caller by the outer dispatch loop. The
/// display strings are the human-readable texts that go into the error
/// message body.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Invalid message body")]
    InvalidMessage,
    #[error("Message forwarding attempted without calling Hello()")]
    PeerNotRegistered,
    #[error("Hello() was not yet called")]
    PeerNotYetRegistered,
    #[error("Hello() already called")]
    PeerAlreadyRegistered,
    #[error("The caller does not have the necessary privileged to call this method")]
    PeerNotPrivileged,
    #[error("Unexpected message type")]
    UnexpectedMessageType,
    #[error("Invalid object path")]
    UnexpectedPath,
    #[error("Invalid interface")]
    UnexpectedInterface,
    #[error("Invalid method call")]
    UnexpectedMethod,
    #[error("Invalid property")]
    UnexpectedProperty,
    #[error("Cannot set read-only property")]
    ReadonlyProperty,
    #[error("Invalid signature for method")]
    UnexpectedSignature,
    #[error("No pending reply with that serial")]
    UnexpectedReply,
    #[error("Request could not be forwarded to the parent process")]
    ForwardFailed,
    #[error("Sending user's quota exceeded")]
    Quota,
    #[error("Invalid flags")]
    UnexpectedFlags,
    #[error("Sender is not authorized to send message")]
    SendDenied,
    #[error("Receiver is not authorized to receive message")]
    ReceiveDenied,
    #[error("Pending reply with that serial already exists")]
    ExpectedReplyExists,
    #[error("org.freedesktop.DBus is a reserved name")]
    NameReserved,
    #[error("The name is a unique name")]
    NameUnique,
    #[error("The name is not a valid well-known name")]
    NameInvalid,
    #[error("Request to own name refused by policy")]
    NameRefused,
    #[error("The name does not exist")]
    NameNotFound,
    #[error("The name is not activatable")]
    NameNotActivatable,
    #[error("The name does not have an owner")]
    NameOwnerNotFound,
    #[error("The connection does not exist")]
    PeerNotFound,
    #[error("Destination does not exist")]
    DestinationNotFound,
    #[error("Invalid match rule")]
    MatchInvalid,
    #[error("The match does not exist")]
    MatchNotFound,
    #[error("Solaris ADT is not supported")]
    AdtNotSupported,
    #[error("SELinux is not supported")]
    SelinuxNotSupported,
    #[error("Protocol violation")]
    ProtocolViolation,
    /// Non-protocol failure. Aborts the dispatch and propagates to the
    /// embedding broker.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl DriverError {
    /// The D-Bus error name this kind is reported as, or `None` when the
    /// error never makes it onto the wire (fatal errors and protocol
    /// violations terminate the connection instead).
    ///
    /// `UnkonwnProperty` is not a typo of ours: the reference bus
    /// implementation emits the misspelled name and clients match on it.
    pub fn dbus_name(&self) -> Option<&'static str> {
        use DriverError::*;

        match self {
            PeerAlreadyRegistered => Some("org.freedesktop.DBus.Error.Failed"),
            PeerNotYetRegistered | UnexpectedPath | UnexpectedMessageType | UnexpectedReply
            | ExpectedReplyExists | SendDenied | ReceiveDenied | PeerNotPrivileged
            | NameRefused => Some("org.freedesktop.DBus.Error.AccessDenied"),
            UnexpectedInterface => Some("org.freedesktop.DBus.Error.UnknownInterface"),
            UnexpectedMethod => Some("org.freedesktop.DBus.Error.UnknownMethod"),
            UnexpectedProperty => Some("org.freedesktop.DBus.Error.UnkonwnProperty"),
            ReadonlyProperty => Some("org.freedesktop.DBus.Error.PropertyReadOnly"),
            UnexpectedSignature | UnexpectedFlags | NameReserved | NameUnique | NameInvalid => {
                Some("org.freedesktop.DBus.Error.InvalidArgs")
            }
            ForwardFailed | Quota => Some("org.freedesktop.DBus.Error.LimitsExceeded"),
            PeerNotFound | NameNotFound | NameOwnerNotFound | DestinationNotFound => {
                Some("org.freedesktop.DBus.Error.NameHasNoOwner")
            }
            NameNotActivatable => Some("org.freedesktop.DBus.Error.ServiceUnknown"),
            MatchInvalid => Some("org.freedesktop.DBus.Error.MatchRuleInvalid"),
            MatchNotFound => Some("org.freedesktop.DBus.Error.MatchRuleNotFound"),
            AdtNotSupported => Some("org.freedesktop.DBus.Error.AdtAuditDataUnknown"),
            SelinuxNotSupported => {
                Some("org.freedesktop.DBus.Error.SELinuxSecurityContextUnknown")
            }
            InvalidMessage | PeerNotRegistered | ProtocolViolation | Fatal(_) => None,
        }
    }
}
