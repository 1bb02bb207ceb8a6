// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::types::Prefix4;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, u8 as parse_u8},
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::net::Ipv4Addr;

/// Total message length is carried in a 16-bit field, so a single message
/// can never exceed this.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// The original FPM protocol version.
pub const FPM_VERSION_1: u8 = 1;

/// The first protocol version whose peers send keepalives. Sessions from
/// peers at or above this version are subject to idle-timeout enforcement.
pub const FPM_VERSION_KEEPALIVE: u8 = 2;

/// FPM message types.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The message body is a netlink-derived route update.
    Netlink = 1,

    /// A liveness probe with no semantic content. Reserved type; any body
    /// bytes are ignored.
    Keepalive = 2,
}

impl From<&MessageBody> for MessageType {
    fn from(b: &MessageBody) -> Self {
        match b {
            MessageBody::RouteUpdate(_) => Self::Netlink,
            MessageBody::Keepalive => Self::Keepalive,
        }
    }
}

/// Each FPM message starts with a fixed size header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     Type      |        Message length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The length covers the entire message, header included.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub version: u8,
    pub typ: MessageType,
    pub length: u16,
}

impl Header {
    pub const WIRE_SIZE: usize = 4;

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.version, self.typ.into()];
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Deserialize a header from wire format.
    pub fn from_wire(input: &[u8]) -> Result<Header, Error> {
        let (input, version) = parse_u8(input)?;
        let (input, typ) = parse_u8(input)?;
        let (_, length) = be_u16(input)?;
        let typ = MessageType::try_from(typ)?;
        Ok(Header {
            version,
            typ,
            length,
        })
    }
}

/// A complete FPM message: the header's protocol version plus the parsed
/// body. The session layer inspects the version of the first message on a
/// connection to decide whether keepalive enforcement applies.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    pub version: u8,
    pub body: MessageBody,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MessageBody {
    RouteUpdate(RouteUpdateMessage),
    Keepalive,
}

impl Message {
    pub fn route_update(version: u8, m: RouteUpdateMessage) -> Message {
        Message {
            version,
            body: MessageBody::RouteUpdate(m),
        }
    }

    pub fn keepalive() -> Message {
        Message {
            version: FPM_VERSION_KEEPALIVE,
            body: MessageBody::Keepalive,
        }
    }

    /// Serialize the message to wire format, header included.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let body = match &self.body {
            MessageBody::RouteUpdate(m) => m.to_wire(),
            MessageBody::Keepalive => Vec::new(),
        };
        let length = body.len() + Header::WIRE_SIZE;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge("fpm message".into()));
        }
        let header = Header {
            version: self.version,
            typ: MessageType::from(&self.body),
            length: length as u16,
        };
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// Netlink route message types. Values this gateway does not act on are
/// preserved rather than rejected so a session survives a daemon that sends
/// message kinds we do not mirror.
#[derive(Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum RtmType {
    NewRoute = 24,
    DelRoute = 25,
    GetRoute = 26,

    #[num_enum(catch_all)]
    Other(u8),
}

/// The routing daemon a route update originated from. Only routes tagged
/// with the upstream daemon's protocol, or the unspecified sentinel, are
/// mirrored.
#[derive(Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum RouteProtocol {
    Unspec = 0,
    Kernel = 2,
    Static = 4,
    Zebra = 11,

    #[num_enum(catch_all)]
    Other(u8),
}

/// The IPv4 address family discriminant in a route update.
pub const AF_INET: u8 = 2;

/// Attribute type carrying the destination address of a route.
pub const RTA_DESTINATION: u8 = 1;

/// Attribute type carrying the gateway (next hop) of a route.
pub const RTA_GATEWAY: u8 = 5;

/// A typed attribute attached to a route update. Attribute types outside
/// this set are skipped during parsing.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RouteAttribute {
    /// The destination address. Combined with the prefix length from the
    /// fixed part of the message to form the destination prefix.
    Destination(Ipv4Addr),

    /// The next hop the destination is reachable through. Absent for
    /// interface-only routes.
    Gateway(Ipv4Addr),
}

/// A netlink-derived route update: a fixed part followed by a list of
/// attributes running to the end of the message.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Rtm type    |    Family     |  Dst length   |   Protocol    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Attr type   |  Attr length  |     Attribute value ...       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                     Attributes (cont, variable)               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RouteUpdateMessage {
    pub typ: RtmType,
    pub family: u8,
    pub dst_len: u8,
    pub protocol: RouteProtocol,
    pub attributes: Vec<RouteAttribute>,
}

impl RouteUpdateMessage {
    /// Create a route announcement for `prefix` reachable via `gateway`.
    pub fn add(prefix: Prefix4, gateway: Ipv4Addr) -> RouteUpdateMessage {
        RouteUpdateMessage {
            typ: RtmType::NewRoute,
            family: AF_INET,
            dst_len: prefix.length,
            protocol: RouteProtocol::Zebra,
            attributes: vec![
                RouteAttribute::Destination(prefix.value),
                RouteAttribute::Gateway(gateway),
            ],
        }
    }

    /// Create a route withdrawal for `prefix`. Deletions carry no gateway;
    /// the receiver is expected to remember the next hop it installed.
    pub fn delete(prefix: Prefix4) -> RouteUpdateMessage {
        RouteUpdateMessage {
            typ: RtmType::DelRoute,
            family: AF_INET,
            dst_len: prefix.length,
            protocol: RouteProtocol::Zebra,
            attributes: vec![RouteAttribute::Destination(prefix.value)],
        }
    }

    /// The destination prefix, if a destination attribute is present.
    pub fn destination(&self) -> Option<Prefix4> {
        self.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(addr) => {
                Some(Prefix4::new(*addr, self.dst_len))
            }
            _ => None,
        })
    }

    /// The next hop, if a gateway attribute is present.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Serialize a route update to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![
            self.typ.into(),
            self.family,
            self.dst_len,
            self.protocol.into(),
        ];
        for attr in &self.attributes {
            match attr {
                RouteAttribute::Destination(addr) => {
                    buf.push(RTA_DESTINATION);
                    buf.push(4);
                    buf.extend_from_slice(&addr.octets());
                }
                RouteAttribute::Gateway(addr) => {
                    buf.push(RTA_GATEWAY);
                    buf.push(4);
                    buf.extend_from_slice(&addr.octets());
                }
            }
        }
        buf
    }

    /// Deserialize a route update from wire format.
    pub fn from_wire(input: &[u8]) -> Result<RouteUpdateMessage, Error> {
        let (input, typ) = parse_u8(input)?;
        let (input, family) = parse_u8(input)?;
        let (input, dst_len) = parse_u8(input)?;
        let (input, protocol) = parse_u8(input)?;

        let mut attributes = Vec::new();
        let mut input = input;
        while !input.is_empty() {
            let (out, attr_typ) = parse_u8(input)?;
            let (out, attr_len) = parse_u8(out)?;
            let (out, value) = take(usize::from(attr_len))(out)?;
            match attr_typ {
                RTA_DESTINATION => {
                    attributes
                        .push(RouteAttribute::Destination(addr4(value)?));
                }
                RTA_GATEWAY => {
                    attributes.push(RouteAttribute::Gateway(addr4(value)?));
                }
                // Unknown attributes are skipped, not an error.
                _ => {}
            }
            input = out;
        }

        Ok(RouteUpdateMessage {
            typ: RtmType::from(typ),
            family,
            dst_len,
            protocol: RouteProtocol::from(protocol),
            attributes,
        })
    }
}

fn addr4(value: &[u8]) -> Result<Ipv4Addr, Error> {
    let octets: [u8; 4] = value.try_into().map_err(|_| Error::BadLength {
        expected: 4,
        found: value.len() as u8,
    })?;
    Ok(Ipv4Addr::from(octets))
}

/// Incremental reassembly of FPM messages from a TCP byte stream.
///
/// Bytes are appended as they arrive with [`FrameDecoder::extend`] and
/// complete messages are drained with [`FrameDecoder::next`]. Consumption is
/// atomic: nothing is taken from the buffer until the whole message declared
/// by the header is present, so any fragmentation of the input stream yields
/// the same message sequence.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes to the reassembly buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Produce the next complete message, or `None` if the buffer does not
    /// yet hold one.
    pub fn next(&mut self) -> Result<Option<Message>, Error> {
        if self.buf.len() < Header::WIRE_SIZE {
            return Ok(None);
        }
        let header = Header::from_wire(&self.buf[..Header::WIRE_SIZE])?;
        let length = usize::from(header.length);
        if length < Header::WIRE_SIZE {
            return Err(Error::TooSmall(format!(
                "message length {length} does not cover the header"
            )));
        }
        if self.buf.len() < length {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..length).collect();
        let body = &frame[Header::WIRE_SIZE..];
        let body = match header.typ {
            MessageType::Netlink => {
                MessageBody::RouteUpdate(RouteUpdateMessage::from_wire(body)?)
            }
            MessageType::Keepalive => MessageBody::Keepalive,
        };
        Ok(Some(Message {
            version: header.version,
            body,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sample_messages() -> Vec<Message> {
        let p1: Prefix4 = "192.168.1.0/24".parse().unwrap();
        let p2: Prefix4 = "10.10.0.0/16".parse().unwrap();
        vec![
            Message::route_update(
                FPM_VERSION_KEEPALIVE,
                RouteUpdateMessage::add(p1, "10.0.0.1".parse().unwrap()),
            ),
            Message::keepalive(),
            Message::route_update(
                FPM_VERSION_1,
                RouteUpdateMessage::add(p2, "10.0.0.2".parse().unwrap()),
            ),
            Message::route_update(
                FPM_VERSION_KEEPALIVE,
                RouteUpdateMessage::delete(p1),
            ),
        ]
    }

    #[test]
    fn header_wire_format() {
        let h = Header {
            version: FPM_VERSION_KEEPALIVE,
            typ: MessageType::Netlink,
            length: 260,
        };
        let buf = h.to_wire();
        assert_eq!(buf, vec![2, 1, 1, 4]);
        assert_eq!(Header::from_wire(&buf).unwrap(), h);
    }

    #[test]
    fn header_rejects_unknown_type() {
        assert!(matches!(
            Header::from_wire(&[1, 99, 0, 4]),
            Err(Error::MessageType(_))
        ));
    }

    #[test]
    fn route_update_through_decoder() {
        let msg = Message::route_update(
            FPM_VERSION_1,
            RouteUpdateMessage::add(
                "192.168.1.0/24".parse().unwrap(),
                "10.0.0.1".parse().unwrap(),
            ),
        );
        let mut decoder = FrameDecoder::new();
        decoder.extend(&msg.to_wire().unwrap());
        assert_eq!(decoder.next().unwrap(), Some(msg));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn unknown_attributes_are_skipped() {
        let mut body = vec![
            u8::from(RtmType::NewRoute),
            AF_INET,
            24,
            u8::from(RouteProtocol::Zebra),
        ];
        // an attribute type we do not understand
        body.extend_from_slice(&[77, 2, 0xaa, 0xbb]);
        body.extend_from_slice(&[RTA_DESTINATION, 4, 192, 168, 1, 0]);
        body.extend_from_slice(&[RTA_GATEWAY, 4, 10, 0, 0, 1]);

        let m = RouteUpdateMessage::from_wire(&body).unwrap();
        assert_eq!(m.destination(), Some("192.168.1.0/24".parse().unwrap()));
        assert_eq!(m.gateway(), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn runt_length_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[1, 1, 0, 2]);
        assert!(matches!(decoder.next(), Err(Error::TooSmall(_))));
    }

    #[test]
    fn keepalive_body_bytes_are_ignored() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[2, 2, 0, 6, 0xde, 0xad]);
        let msg = decoder.next().unwrap().unwrap();
        assert_eq!(msg.body, MessageBody::Keepalive);
    }

    proptest! {
        /// Feeding an encoded message sequence to the decoder in chunks of
        /// any size yields the same sequence as feeding it whole.
        #[test]
        fn reassembly_is_fragmentation_invariant(chunk in 1usize..64) {
            let msgs = sample_messages();
            let mut wire = Vec::new();
            for m in &msgs {
                wire.extend(m.to_wire().unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.extend(piece);
                while let Some(m) = decoder.next().unwrap() {
                    decoded.push(m);
                }
            }
            prop_assert_eq!(decoded, msgs);
        }
    }
}
