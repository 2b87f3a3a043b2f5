//! NetFinder discovery datagram codec.
//!
//! Bridges answer a broadcast `IDENTIFY` request with a single fixed-size
//! `IDENTIFY_REPLY` datagram. Both share a 12-byte header:
//!
//! | Field    | Offset | Size | Notes                          |
//! |----------|--------|------|--------------------------------|
//! | magic    | 0      | 1    | always `0x5A`                  |
//! | msg_type | 1      | 1    | 0 = identify, 1 = reply        |
//! | sequence | 2      | 2    | big-endian, echoed by replies  |
//! | hw addr  | 4      | 6    | `FF×6` in requests             |
//! | reserved | 10     | 2    | zero                           |
//!
//! The reply appends a 64-byte payload carrying uptime, network settings,
//! firmware versions and the device name. All multi-byte fields are in
//! network byte order.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, BridgeResult};

/// UDP port bridges listen on for identify requests.
pub const NETFINDER_PORT: u16 = 3040;

/// Magic byte leading every NetFinder datagram.
pub const MAGIC: u8 = 0x5A;

/// Message type of an identify request.
pub const IDENTIFY: u8 = 0;

/// Message type of an identify reply.
pub const IDENTIFY_REPLY: u8 = 1;

/// Header length shared by requests and replies.
pub const HEADER_LEN: usize = 12;

/// Length of the payload following the header in a reply.
pub const REPLY_PAYLOAD_LEN: usize = 64;

/// Exact on-wire length of an identify reply.
pub const REPLY_LEN: usize = HEADER_LEN + REPLY_PAYLOAD_LEN;

const NAME_LEN: usize = 32;

/// Ethernet hardware address, rendered as `AA-BB-CC-DD-EE-FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-ones address used as the request destination.
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}-{b:02X}-{c:02X}-{d:02X}-{e:02X}-{g:02X}")
    }
}

/// How the bridge obtained its IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAssignment {
    /// Leased from DHCP.
    Dynamic,
    /// Configured on the bridge.
    Static,
    /// Value not defined by the protocol, kept verbatim.
    Unknown(u8),
}

impl From<u8> for IpAssignment {
    fn from(value: u8) -> Self {
        match value {
            0 => IpAssignment::Dynamic,
            1 => IpAssignment::Static,
            other => IpAssignment::Unknown(other),
        }
    }
}

impl From<IpAssignment> for u8 {
    fn from(value: IpAssignment) -> Self {
        match value {
            IpAssignment::Dynamic => 0,
            IpAssignment::Static => 1,
            IpAssignment::Unknown(other) => other,
        }
    }
}

/// Firmware or hardware version. Four bytes travel on the wire; only the first
/// three are meaningful and the display form is `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub [u8; 4]);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Time since the bridge last booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uptime {
    /// Whole days.
    pub days: u16,
    /// Hours, 0-23.
    pub hours: u8,
    /// Minutes, 0-59.
    pub minutes: u8,
    /// Seconds, 0-59.
    pub seconds: u8,
}

impl Uptime {
    /// Total uptime as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        let secs = u64::from(self.days) * 86_400
            + u64::from(self.hours) * 3_600
            + u64::from(self.minutes) * 60
            + u64::from(self.seconds);
        Duration::from_secs(secs)
    }
}

/// Identify request broadcast by the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Sequence number replies must echo.
    pub sequence: u16,
    /// Target hardware address, [`MacAddress::BROADCAST`] for discovery.
    pub destination: MacAddress,
}

/// Identify reply sent back by a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    /// Sequence number echoed from the request.
    pub sequence: u16,
    /// Bridge hardware address; the key used to deduplicate replies.
    pub hw_addr: MacAddress,
    /// Time since boot.
    pub uptime: Uptime,
    /// Device mode byte, passed through uninterpreted.
    pub mode: u8,
    /// Alert flags, passed through uninterpreted.
    pub alert: u8,
    /// How the IP address was assigned.
    pub ip_type: IpAssignment,
    /// Address to open a control session on.
    pub ip_addr: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Application firmware version.
    pub app_version: Version,
    /// Bootloader version.
    pub boot_version: Version,
    /// Hardware revision.
    pub hw_version: Version,
    /// Device name, at most 32 ASCII characters.
    pub name: String,
}

/// Encode an identify request addressed to every bridge on the segment.
pub fn encode_request(sequence: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, IDENTIFY, sequence, MacAddress::BROADCAST);
    buf.freeze()
}

/// Decode an identify request. Bridge simulators use this to echo the sequence.
pub fn decode_request(mut buf: &[u8]) -> BridgeResult<DiscoveryRequest> {
    if buf.len() != HEADER_LEN {
        return Err(BridgeError::MalformedReply(format!(
            "request is {} bytes, expected {}",
            buf.len(),
            HEADER_LEN
        )));
    }
    let (sequence, destination) = get_header(&mut buf, IDENTIFY)?;
    Ok(DiscoveryRequest {
        sequence,
        destination,
    })
}

/// Decode one identify reply datagram.
///
/// The buffer must be exactly [`REPLY_LEN`] bytes; replies are single datagrams so
/// there is no partial decode. Sequence matching is left to the caller.
pub fn decode_reply(mut buf: &[u8]) -> BridgeResult<DiscoveryReply> {
    if buf.len() != REPLY_LEN {
        return Err(BridgeError::MalformedReply(format!(
            "reply is {} bytes, expected {}",
            buf.len(),
            REPLY_LEN
        )));
    }

    let (sequence, hw_addr) = get_header(&mut buf, IDENTIFY_REPLY)?;

    let uptime = Uptime {
        days: buf.get_u16(),
        hours: buf.get_u8(),
        minutes: buf.get_u8(),
        seconds: buf.get_u8(),
    };
    let mode = buf.get_u8();
    let alert = buf.get_u8();
    let ip_type = IpAssignment::from(buf.get_u8());
    let ip_addr = Ipv4Addr::from(buf.get_u32());
    let netmask = Ipv4Addr::from(buf.get_u32());
    let gateway = Ipv4Addr::from(buf.get_u32());
    let app_version = get_version(&mut buf);
    let boot_version = get_version(&mut buf);
    let hw_version = get_version(&mut buf);

    let mut name = [0u8; NAME_LEN];
    buf.copy_to_slice(&mut name);

    Ok(DiscoveryReply {
        sequence,
        hw_addr,
        uptime,
        mode,
        alert,
        ip_type,
        ip_addr,
        netmask,
        gateway,
        app_version,
        boot_version,
        hw_version,
        name: decode_name(&name),
    })
}

impl DiscoveryReply {
    /// Encode this reply as a bridge would send it.
    ///
    /// Names longer than 32 bytes are truncated; shorter names are NUL padded.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REPLY_LEN);
        put_header(&mut buf, IDENTIFY_REPLY, self.sequence, self.hw_addr);

        buf.put_u16(self.uptime.days);
        buf.put_u8(self.uptime.hours);
        buf.put_u8(self.uptime.minutes);
        buf.put_u8(self.uptime.seconds);
        buf.put_u8(self.mode);
        buf.put_u8(self.alert);
        buf.put_u8(self.ip_type.into());
        buf.put_u32(self.ip_addr.into());
        buf.put_u32(self.netmask.into());
        buf.put_u32(self.gateway.into());
        buf.put_slice(&self.app_version.0);
        buf.put_slice(&self.boot_version.0);
        buf.put_slice(&self.hw_version.0);

        let mut name = [0u8; NAME_LEN];
        let len = self.name.len().min(NAME_LEN);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        buf.put_slice(&name);

        buf.freeze()
    }
}

fn put_header(buf: &mut BytesMut, msg_type: u8, sequence: u16, addr: MacAddress) {
    buf.put_u8(MAGIC);
    buf.put_u8(msg_type);
    buf.put_u16(sequence);
    buf.put_slice(&addr.0);
    buf.put_bytes(0, 2);
}

fn get_header(buf: &mut &[u8], expected_type: u8) -> BridgeResult<(u16, MacAddress)> {
    let magic = buf.get_u8();
    if magic != MAGIC {
        return Err(BridgeError::MalformedReply(format!(
            "bad magic 0x{magic:02X}"
        )));
    }
    let msg_type = buf.get_u8();
    if msg_type != expected_type {
        return Err(BridgeError::MalformedReply(format!(
            "unexpected message type {msg_type}"
        )));
    }
    let sequence = buf.get_u16();
    let mut addr = [0u8; 6];
    buf.copy_to_slice(&mut addr);
    buf.advance(2);
    Ok((sequence, MacAddress(addr)))
}

fn get_version(buf: &mut &[u8]) -> Version {
    let mut raw = [0u8; 4];
    buf.copy_to_slice(&mut raw);
    Version(raw)
}

/// Best-effort ASCII: non-ASCII bytes are dropped, trailing NUL padding trimmed.
fn decode_name(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect();
    text.trim_end_matches('\0').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> DiscoveryReply {
        DiscoveryReply {
            sequence: 1234,
            hw_addr: MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            uptime: Uptime {
                days: 3,
                hours: 4,
                minutes: 5,
                seconds: 6,
            },
            mode: 1,
            alert: 0,
            ip_type: IpAssignment::Static,
            ip_addr: Ipv4Addr::new(192, 168, 1, 50),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            app_version: Version([1, 6, 6, 0]),
            boot_version: Version([1, 2, 0, 0]),
            hw_version: Version([2, 0, 1, 9]),
            name: "GPIB-ETHERNET".to_string(),
        }
    }

    #[test]
    fn request_layout_is_bit_exact() {
        let bytes = encode_request(0x1234);
        assert_eq!(
            bytes.as_ref(),
            &[0x5A, 0x00, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]
        );

        let request = decode_request(&bytes).unwrap();
        assert_eq!(request.sequence, 0x1234);
        assert_eq!(request.destination, MacAddress::BROADCAST);
    }

    #[test]
    fn reply_fields_survive_encoding() {
        let reply = sample_reply();
        let bytes = reply.encode();
        assert_eq!(bytes.len(), REPLY_LEN);
        assert_eq!(decode_reply(&bytes).unwrap(), reply);
    }

    #[test]
    fn reply_payload_offsets() {
        let bytes = sample_reply().encode();
        // sequence, big-endian
        assert_eq!(&bytes[2..4], &[0x04, 0xD2]);
        // uptime days
        assert_eq!(&bytes[12..14], &[0x00, 0x03]);
        // ip address starts after uptime(5) + mode + alert + ip_type
        assert_eq!(&bytes[20..24], &[192, 168, 1, 50]);
        // name occupies the last 32 bytes
        assert_eq!(&bytes[44..57], b"GPIB-ETHERNET");
        assert!(bytes[57..].iter().all(|&b| b == 0));
    }

    #[test]
    fn renders_dotted_fields() {
        let reply = decode_reply(&sample_reply().encode()).unwrap();
        assert_eq!(reply.ip_addr.to_string(), "192.168.1.50");
        assert_eq!(reply.app_version.to_string(), "1.6.6");
        assert_eq!(reply.hw_version.to_string(), "2.0.1");
        assert_eq!(reply.hw_addr.to_string(), "AA-BB-CC-DD-EE-FF");
        assert_eq!(
            reply.uptime.as_duration(),
            Duration::from_secs(3 * 86_400 + 4 * 3_600 + 5 * 60 + 6)
        );
    }

    #[test]
    fn rejects_wrong_length() {
        let bytes = sample_reply().encode();
        for len in [0, HEADER_LEN, REPLY_LEN - 1] {
            assert!(matches!(
                decode_reply(&bytes[..len]),
                Err(BridgeError::MalformedReply(_))
            ));
        }

        let mut long = bytes.to_vec();
        long.push(0);
        assert!(matches!(
            decode_reply(&long),
            Err(BridgeError::MalformedReply(_))
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = sample_reply().encode().to_vec();
        bytes[0] = 0x5B;
        assert!(matches!(
            decode_reply(&bytes),
            Err(BridgeError::MalformedReply(_))
        ));
    }

    #[test]
    fn rejects_request_echo() {
        let mut bytes = sample_reply().encode().to_vec();
        bytes[1] = IDENTIFY;
        assert!(matches!(
            decode_reply(&bytes),
            Err(BridgeError::MalformedReply(_))
        ));
    }

    #[test]
    fn name_drops_garbage_bytes() {
        let mut bytes = sample_reply().encode().to_vec();
        let name = &mut bytes[REPLY_LEN - NAME_LEN..];
        name.fill(0);
        name[..6].copy_from_slice(b"lab\xFF-4");
        name[6] = 0xC3;
        name[7] = b' ';
        let reply = decode_reply(&bytes).unwrap();
        assert_eq!(reply.name, "lab-4 ");
    }

    #[test]
    fn varied_replies_survive_encoding() {
        let names = ["Bench A ", " lead", "tab\t", "", "x", "0123456789abcdef0123456789ABCDEF"];
        for (i, name) in names.into_iter().enumerate() {
            let n = i as u8;
            let reply = DiscoveryReply {
                sequence: u16::MAX - u16::from(n),
                hw_addr: MacAddress([n, 0xFF, 0, n, 0x80, 0x7F]),
                uptime: Uptime {
                    days: u16::from(n) * 1000,
                    hours: 23,
                    minutes: 59,
                    seconds: n,
                },
                mode: n,
                alert: 255 - n,
                ip_type: IpAssignment::from(n),
                ip_addr: Ipv4Addr::new(10, n, 255, 1),
                netmask: Ipv4Addr::new(255, 255, 0, 0),
                gateway: Ipv4Addr::UNSPECIFIED,
                app_version: Version([n, 1, 2, 3]),
                boot_version: Version([0, 0, 0, n]),
                hw_version: Version([255, n, 0, 9]),
                name: name.to_string(),
            };
            assert_eq!(decode_reply(&reply.encode()).unwrap(), reply, "name {name:?}");
        }
    }

    #[test]
    fn preserves_unknown_ip_assignment() {
        let mut reply = sample_reply();
        reply.ip_type = IpAssignment::Unknown(7);
        let decoded = decode_reply(&reply.encode()).unwrap();
        assert_eq!(decoded.ip_type, IpAssignment::Unknown(7));
    }
}
