//! MQTT 3.1.1 control packets as a closed sum type.
//!
//! The session engine only relies on a small surface of this module: decoding / encoding via
//!  [read_packet] and [write_packet], the packet kind, and reading or assigning message
//!  identifiers. Everything else is plain data.

use bitflags::bitflags;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

mod codec;

pub use codec::{read_packet, write_packet};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

// manual impls: num_enum would treat a `#[default]` variant as a catch-all when decoding
impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

impl Default for ConnectReturnCode {
    fn default() -> Self {
        ConnectReturnCode::Accepted
    }
}

bitflags! {
    /// The flags byte in the variable header of CONNECT
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct ConnectFlags: u8 {
        const CLEAN_SESSION = 0b0000_0010;
        const WILL = 0b0000_0100;
        const WILL_QOS_1 = 0b0000_1000;
        const WILL_QOS_2 = 0b0001_0000;
        const WILL_RETAIN = 0b0010_0000;
        const PASSWORD = 0b0100_0000;
        const USERNAME = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub clean_session: bool,
    /// keepalive interval in seconds, 0 disables keepalive on the server side
    pub keep_alive: u16,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}
impl Default for ConnectPacket {
    fn default() -> Self {
        ConnectPacket {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// 0 means 'not assigned yet' - QoS 0 packets never carry an identifier on the wire
    pub message_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SubscribePacket {
    pub message_id: u16,
    pub topics: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SubackPacket {
    pub message_id: u16,
    /// granted QoS per requested topic filter, or 0x80 for failure
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct UnsubscribePacket {
    pub message_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback { message_id: u16 },
    Pubrec { message_id: u16 },
    Pubrel { message_id: u16 },
    Pubcomp { message_id: u16 },
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback { message_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl ControlPacket {
    /// A fresh packet of the given kind with all fields at their defaults and no message id
    pub fn new(kind: PacketKind) -> ControlPacket {
        match kind {
            PacketKind::Connect => ControlPacket::Connect(ConnectPacket::default()),
            PacketKind::Connack => ControlPacket::Connack(ConnackPacket::default()),
            PacketKind::Publish => ControlPacket::Publish(PublishPacket::default()),
            PacketKind::Puback => ControlPacket::Puback { message_id: 0 },
            PacketKind::Pubrec => ControlPacket::Pubrec { message_id: 0 },
            PacketKind::Pubrel => ControlPacket::Pubrel { message_id: 0 },
            PacketKind::Pubcomp => ControlPacket::Pubcomp { message_id: 0 },
            PacketKind::Subscribe => ControlPacket::Subscribe(SubscribePacket::default()),
            PacketKind::Suback => ControlPacket::Suback(SubackPacket::default()),
            PacketKind::Unsubscribe => ControlPacket::Unsubscribe(UnsubscribePacket::default()),
            PacketKind::Unsuback => ControlPacket::Unsuback { message_id: 0 },
            PacketKind::Pingreq => ControlPacket::Pingreq,
            PacketKind::Pingresp => ControlPacket::Pingresp,
            PacketKind::Disconnect => ControlPacket::Disconnect,
        }
    }

    /// convenience for the four publish acknowledgments and UNSUBACK
    pub fn ack(kind: PacketKind, message_id: u16) -> ControlPacket {
        let mut packet = ControlPacket::new(kind);
        packet.set_message_id(message_id);
        packet
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            ControlPacket::Connect(_) => PacketKind::Connect,
            ControlPacket::Connack(_) => PacketKind::Connack,
            ControlPacket::Publish(_) => PacketKind::Publish,
            ControlPacket::Puback { .. } => PacketKind::Puback,
            ControlPacket::Pubrec { .. } => PacketKind::Pubrec,
            ControlPacket::Pubrel { .. } => PacketKind::Pubrel,
            ControlPacket::Pubcomp { .. } => PacketKind::Pubcomp,
            ControlPacket::Subscribe(_) => PacketKind::Subscribe,
            ControlPacket::Suback(_) => PacketKind::Suback,
            ControlPacket::Unsubscribe(_) => PacketKind::Unsubscribe,
            ControlPacket::Unsuback { .. } => PacketKind::Unsuback,
            ControlPacket::Pingreq => PacketKind::Pingreq,
            ControlPacket::Pingresp => PacketKind::Pingresp,
            ControlPacket::Disconnect => PacketKind::Disconnect,
        }
    }

    /// The packet's message identifier, for kinds that carry one (including QoS 0 publishes,
    ///  where it is always 0)
    pub fn message_id(&self) -> Option<u16> {
        match self {
            ControlPacket::Publish(p) => Some(p.message_id),
            ControlPacket::Subscribe(p) => Some(p.message_id),
            ControlPacket::Suback(p) => Some(p.message_id),
            ControlPacket::Unsubscribe(p) => Some(p.message_id),
            ControlPacket::Puback { message_id }
            | ControlPacket::Pubrec { message_id }
            | ControlPacket::Pubrel { message_id }
            | ControlPacket::Pubcomp { message_id }
            | ControlPacket::Unsuback { message_id } => Some(*message_id),
            ControlPacket::Connect(_)
            | ControlPacket::Connack(_)
            | ControlPacket::Pingreq
            | ControlPacket::Pingresp
            | ControlPacket::Disconnect => None,
        }
    }

    /// true for locally originated packets that start an acknowledged flow and have no
    ///  identifier yet: QoS 1/2 PUBLISH, SUBSCRIBE, UNSUBSCRIBE
    pub fn needs_message_id(&self) -> bool {
        match self {
            ControlPacket::Publish(p) => p.qos != QoS::AtMostOnce && p.message_id == 0,
            ControlPacket::Subscribe(p) => p.message_id == 0,
            ControlPacket::Unsubscribe(p) => p.message_id == 0,
            _ => false,
        }
    }

    /// The identifier of a packet that starts an acknowledged flow and already carries one,
    ///  e.g. a retransmitted PUBLISH
    pub fn preassigned_message_id(&self) -> Option<u16> {
        let id = match self {
            ControlPacket::Publish(p) if p.qos != QoS::AtMostOnce => p.message_id,
            ControlPacket::Subscribe(p) => p.message_id,
            ControlPacket::Unsubscribe(p) => p.message_id,
            _ => 0,
        };
        (id != 0).then_some(id)
    }

    /// no-op for kinds without a message identifier
    pub fn set_message_id(&mut self, id: u16) {
        match self {
            ControlPacket::Publish(p) => p.message_id = id,
            ControlPacket::Subscribe(p) => p.message_id = id,
            ControlPacket::Suback(p) => p.message_id = id,
            ControlPacket::Unsubscribe(p) => p.message_id = id,
            ControlPacket::Puback { message_id }
            | ControlPacket::Pubrec { message_id }
            | ControlPacket::Pubrel { message_id }
            | ControlPacket::Pubcomp { message_id }
            | ControlPacket::Unsuback { message_id } => *message_id = id,
            ControlPacket::Connect(_)
            | ControlPacket::Connack(_)
            | ControlPacket::Pingreq
            | ControlPacket::Pingresp
            | ControlPacket::Disconnect => {}
        }
    }
}
