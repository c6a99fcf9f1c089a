//! Fixed 8-byte header plus typed payloads.
//!
//! See the header layout table: command(1) flags(1) reliable_ack(2)
//! reliable(2) unreliable(2), all big-endian, no padding.

use anyhow::bail;

use super::deser::Deserialize;
use super::deser::DeserializeResult;
use super::deser::Deserializer;
use super::ser::Serialize;
use super::ser::SerializeResult;
use super::ser::Serializer;
use super::ser::VecSerializer;
use rudp_protocol_derive::WireDeserialize;
use rudp_protocol_derive::WireSerialize;

pub const CMD_NOOP: u8 = 0;
pub const CMD_CLOSE: u8 = 1;
pub const CMD_CONN_REQ: u8 = 2;
pub const CMD_CONN_RSP: u8 = 3;
pub const CMD_PING: u8 = 4;
pub const CMD_PONG: u8 = 5;
pub const APP_BASE: u8 = 0x10;

pub const FLAG_RELIABLE: u8 = 0x01;
pub const FLAG_ACK: u8 = 0x02;
pub const FLAG_RETRANSMITTED: u8 = 0x04;

pub const HEADER_SIZE: usize = 8;

/// Fixed-layout 8-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u8,
    pub flags: u8,
    pub reliable_ack: u16,
    pub reliable: u16,
    pub unreliable: u16,
}

impl Header {
    pub fn is_reliable(&self) -> bool {
        self.flags & FLAG_RELIABLE != 0
    }

    pub fn has_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_retransmitted(&self) -> bool {
        self.flags & FLAG_RETRANSMITTED != 0
    }
}

impl Serialize for Header {
    type Input = Header;
    fn serialize<S: Serializer>(value: &Header, ser: &mut S) -> SerializeResult {
        u8::serialize(&value.command, ser)?;
        u8::serialize(&value.flags, ser)?;
        u16::serialize(&value.reliable_ack, ser)?;
        u16::serialize(&value.reliable, ser)?;
        u16::serialize(&value.unreliable, ser)?;
        Ok(())
    }
}

impl Deserialize for Header {
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(Header {
            command: u8::deserialize(deser)?,
            flags: u8::deserialize(deser)?,
            reliable_ack: u16::deserialize(deser)?,
            reliable: u16::deserialize(deser)?,
            unreliable: u16::deserialize(deser)?,
        })
    }
}

/// CONN_REQ payload: 4 reserved bytes, currently always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, WireSerialize, WireDeserialize)]
pub struct ConnReqBody {
    pub reserved: u32,
}

/// CONN_RSP payload. Nonzero `accepted` means the handshake succeeded; see
/// the open question in the design notes about the (currently unused) reject
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, WireSerialize, WireDeserialize)]
pub struct ConnRspBody {
    pub accepted: u32,
}

impl ConnRspBody {
    pub fn is_accepted(&self) -> bool {
        self.accepted != 0
    }
}

/// PING/PONG payload: a millisecond timestamp, echoed verbatim by PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, WireSerialize, WireDeserialize)]
pub struct TimestampBody {
    pub timestamp_ms: u64,
}

/// The decoded body of a packet, keyed by its command byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Noop,
    Close,
    ConnReq(ConnReqBody),
    ConnRsp(ConnRspBody),
    Ping(TimestampBody),
    Pong(TimestampBody),
    App { sub_command: u8, data: Vec<u8> },
}

impl Body {
    pub fn command_byte(&self) -> u8 {
        match self {
            Body::Noop => CMD_NOOP,
            Body::Close => CMD_CLOSE,
            Body::ConnReq(_) => CMD_CONN_REQ,
            Body::ConnRsp(_) => CMD_CONN_RSP,
            Body::Ping(_) => CMD_PING,
            Body::Pong(_) => CMD_PONG,
            Body::App { sub_command, .. } => APP_BASE.wrapping_add(*sub_command),
        }
    }

    fn write(&self, ser: &mut VecSerializer) -> SerializeResult {
        match self {
            Body::Noop | Body::Close => Ok(()),
            Body::ConnReq(body) => ConnReqBody::serialize(body, ser),
            Body::ConnRsp(body) => ConnRspBody::serialize(body, ser),
            Body::Ping(body) | Body::Pong(body) => TimestampBody::serialize(body, ser),
            Body::App { data, .. } => ser.write_bytes(data),
        }
    }

    /// Encodes just the payload bytes that follow the header. The Send
    /// Queue holds these pre-encoded, since a queued entry is replayed
    /// verbatim on every (re)transmission and only the header around it
    /// changes (fresh ack stamp, RETRANSMITTED flag).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut ser = VecSerializer::new(8);
        self.write(&mut ser).expect("body serialize cannot fail");
        ser.take()
    }
}

/// Assembles a datagram from a header and an already-encoded payload, for
/// callers replaying a Send Queue entry rather than a fresh `Body`.
pub fn encode_raw(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut ser = VecSerializer::new(HEADER_SIZE + payload.len());
    Header::serialize(header, &mut ser).expect("header serialize cannot fail");
    ser.write_bytes(payload).expect("write cannot fail");
    ser.take()
}

/// A fully decoded packet: header plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Body,
}

impl Packet {
    /// Builds a packet, deriving `header.command` from `body` so callers
    /// never have to keep the two in sync by hand. Every other header
    /// field (flags, sequence numbers, ack) is the caller's responsibility.
    pub fn new(mut header: Header, body: Body) -> Packet {
        header.command = body.command_byte();
        Packet { header, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut ser = VecSerializer::new(HEADER_SIZE + 8);
        // Infallible: VecSerializer never overflows.
        Header::serialize(&self.header, &mut ser).expect("header serialize cannot fail");
        self.body.write(&mut ser).expect("body serialize cannot fail");
        ser.take()
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Packet> {
        if data.len() < HEADER_SIZE {
            bail!("malformed packet: shorter than header ({} bytes)", data.len());
        }
        let mut deser = Deserializer::new(data);
        let header = Header::deserialize(&mut deser)?;
        let body = match header.command {
            CMD_NOOP => {
                require_empty(&deser)?;
                Body::Noop
            }
            CMD_CLOSE => {
                require_empty(&deser)?;
                Body::Close
            }
            CMD_CONN_REQ => Body::ConnReq(ConnReqBody::deserialize(&mut deser)?),
            CMD_CONN_RSP => Body::ConnRsp(ConnRspBody::deserialize(&mut deser)?),
            CMD_PING => Body::Ping(TimestampBody::deserialize(&mut deser)?),
            CMD_PONG => Body::Pong(TimestampBody::deserialize(&mut deser)?),
            cmd if cmd >= APP_BASE => Body::App {
                sub_command: cmd.wrapping_sub(APP_BASE),
                data: deser.take_all().to_vec(),
            },
            cmd => bail!("malformed packet: unknown command byte {}", cmd),
        };
        Ok(Packet { header, body })
    }
}

fn require_empty(deser: &Deserializer) -> anyhow::Result<()> {
    if deser.remaining() != 0 {
        bail!(
            "malformed packet: {} trailing bytes for a fixed-size command",
            deser.remaining()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(command: u8, flags: u8, reliable_ack: u16, reliable: u16, unreliable: u16) -> Header {
        Header {
            command,
            flags,
            reliable_ack,
            reliable,
            unreliable,
        }
    }

    #[test]
    fn round_trips_conn_req() {
        let pkt = Packet {
            header: header(CMD_CONN_REQ, FLAG_RELIABLE, 0, 1, 0),
            body: Body::ConnReq(ConnReqBody::default()),
        };
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn round_trips_app_payload() {
        let pkt = Packet {
            header: header(APP_BASE + 3, FLAG_RELIABLE | FLAG_ACK, 5, 6, 0),
            body: Body::App {
                sub_command: 3,
                data: b"hello".to_vec(),
            },
        };
        let bytes = pkt.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn ping_pong_echoes_timestamp() {
        let pkt = Packet {
            header: header(CMD_PING, FLAG_RELIABLE, 0, 1, 0),
            body: Body::Ping(TimestampBody { timestamp_ms: 123456 }),
        };
        let bytes = pkt.encode();
        match Packet::decode(&bytes).unwrap().body {
            Body::Ping(body) => assert_eq!(body.timestamp_ms, 123456),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn encode_raw_matches_full_packet_encode() {
        let body = Body::App {
            sub_command: 2,
            data: b"payload".to_vec(),
        };
        let hdr = header(APP_BASE + 2, FLAG_RELIABLE, 0, 4, 0);
        let via_packet = Packet { header: hdr, body: body.clone() }.encode();
        let via_raw = encode_raw(&hdr, &body.encode_payload());
        assert_eq!(via_packet, via_raw);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(Packet::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut bytes = header(CMD_NOOP, 0, 0, 0, 0);
        bytes.command = 9; // between PONG(5) and APP_BASE(0x10)
        let mut ser = VecSerializer::new(HEADER_SIZE);
        Header::serialize(&bytes, &mut ser).unwrap();
        assert!(Packet::decode(&ser.take()).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes_on_fixed_command() {
        let mut raw = Packet {
            header: header(CMD_NOOP, 0, 0, 0, 0),
            body: Body::Noop,
        }
        .encode();
        raw.push(0xFF);
        assert!(Packet::decode(&raw).is_err());
    }
}
