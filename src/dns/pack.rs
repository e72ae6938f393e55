use std::net::Ipv4Addr;

use anyhow::{bail, ensure, Result};
use packed_struct::{prelude::*, types::bits::Bits};

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 255;

// DNS Header (RFC 1035 4.1.1):
// Byte #  | Bits | Definition
// 0..=1   |      | Transaction ID
// 2       | 0x80 | QR - set on responses
//         | 0x78 | Opcode - 0 for a standard query
//         | 0x04 | AA - Authoritative answer
//         | 0x02 | TC - Truncated
//         | 0x01 | RD - Recursion desired, echoed back
// 3       | 0x80 | RA - Recursion available
//         | 0x70 | Z - Reserved
//         | 0x0F | RCODE
// 4..=5   |      | Question count
// 6..=7   |      | Answer count
// 8..=9   |      | Authority count
// 10..=11 |      | Additional count
#[derive(PackedStruct, Default, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct DnsHeaderPack {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub id: u16,
    #[packed_field(bits = "16")]
    pub response: bool,
    #[packed_field(bits = "17..=20")]
    pub opcode: Integer<u8, Bits<4>>,
    #[packed_field(bits = "21")]
    pub authoritative: bool,
    #[packed_field(bits = "22")]
    pub truncated: bool,
    #[packed_field(bits = "23")]
    pub recursion_desired: bool,
    #[packed_field(bits = "24")]
    pub recursion_available: bool,
    #[packed_field(bits = "25..=27")]
    pub _reserved: ReservedZero<packed_bits::Bits<3>>,
    #[packed_field(bits = "28..=31")]
    pub rcode: Integer<u8, Bits<4>>,
    #[packed_field(bytes = "4..=5", endian = "msb")]
    pub question_count: u16,
    #[packed_field(bytes = "6..=7", endian = "msb")]
    pub answer_count: u16,
    #[packed_field(bytes = "8..=9", endian = "msb")]
    pub authority_count: u16,
    #[packed_field(bytes = "10..=11", endian = "msb")]
    pub additional_count: u16,
}

impl DnsHeaderPack {
    pub fn unpack_header(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_LEN,
            "Datagram too short for a DNS header: {} bytes",
            bytes.len()
        );
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        Ok(Self::unpack(&raw)?)
    }

    pub fn pack_header(&self) -> Result<[u8; HEADER_LEN], PackingError> {
        self.pack()
    }

    /// Header of a reply to `self`, with all counts cleared
    pub fn reply(&self, rcode: u8) -> Self {
        DnsHeaderPack {
            id: self.id,
            response: true,
            opcode: (*self.opcode).into(),
            recursion_desired: self.recursion_desired,
            rcode: rcode.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct DnsQuestion {
    /// Lower-cased, dot separated, without the trailing root label
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A decoded request: the header plus its first question, if any
#[derive(Debug, PartialEq, Clone)]
pub struct DnsQuery {
    pub header: DnsHeaderPack,
    pub question: Option<DnsQuestion>,
    /// Raw bytes of the first question, echoed back in answers
    pub question_bytes: Vec<u8>,
}

impl DnsQuery {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let header = DnsHeaderPack::unpack_header(packet)?;

        if header.question_count == 0 {
            return Ok(DnsQuery {
                header,
                question: None,
                question_bytes: Vec::new(),
            });
        }

        let (question, end) = parse_question(packet, HEADER_LEN)?;
        Ok(DnsQuery {
            header,
            question: Some(question),
            question_bytes: packet[HEADER_LEN..end].to_vec(),
        })
    }

    /// Standard query carrying a single question and nothing in the answer
    /// or authority sections. Additional records (EDNS) are tolerated.
    pub fn is_simple_query(&self) -> bool {
        !self.header.response
            && *self.header.opcode == 0
            && self.header.question_count == 1
            && self.header.answer_count == 0
            && self.header.authority_count == 0
            && self.question.is_some()
    }
}

/// Read one question starting at `offset`. Returns it and the offset just
/// past it.
fn parse_question(packet: &[u8], offset: usize) -> Result<(DnsQuestion, usize)> {
    let mut pos = offset;
    let mut name = String::new();

    loop {
        let Some(&len) = packet.get(pos) else {
            bail!("Question name runs past end of datagram");
        };
        pos += 1;

        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            bail!("Compressed or extended label in question (0x{:02X})", len);
        }

        let label = packet
            .get(pos..pos + len as usize)
            .ok_or_else(|| anyhow::anyhow!("Label runs past end of datagram"))?;
        pos += len as usize;

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label).to_ascii_lowercase());

        ensure!(name.len() <= MAX_NAME_LEN, "Question name too long");
    }

    let fixed = packet
        .get(pos..pos + 4)
        .ok_or_else(|| anyhow::anyhow!("Question type/class missing"))?;
    let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

    Ok((
        DnsQuestion {
            name,
            qtype,
            qclass,
        },
        pos + 4,
    ))
}

/// Answer `query` with a single A record pointing at `ip`
pub fn build_answer(query: &DnsQuery, ttl: u32, ip: Ipv4Addr) -> Result<Vec<u8>> {
    let header = DnsHeaderPack {
        authoritative: true,
        question_count: 1,
        answer_count: 1,
        ..query.header.reply(0)
    };

    let mut bytes = Vec::with_capacity(HEADER_LEN + query.question_bytes.len() + 16);
    bytes.extend_from_slice(&header.pack_header()?);
    bytes.extend_from_slice(&query.question_bytes);

    // Name is a pointer back to the question at offset 12
    bytes.extend_from_slice(&[0xC0, 0x0C]);
    bytes.extend_from_slice(&TYPE_A.to_be_bytes());
    bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
    bytes.extend_from_slice(&ttl.to_be_bytes());
    bytes.extend_from_slice(&4u16.to_be_bytes());
    bytes.extend_from_slice(&ip.octets());

    Ok(bytes)
}

/// Header-only reply carrying `rcode`
pub fn build_error(header: &DnsHeaderPack, rcode: u8) -> Result<Vec<u8>> {
    Ok(header.reply(rcode).pack_header()?.to_vec())
}

#[cfg(test)]
pub(crate) fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let header = DnsHeaderPack {
        id,
        recursion_desired: true,
        question_count: 1,
        ..Default::default()
    };

    let mut bytes = header.pack_header().unwrap().to_vec();
    for label in name.split('.') {
        bytes.push(label.len() as u8);
        bytes.extend_from_slice(label.as_bytes());
    }
    bytes.push(0);
    bytes.extend_from_slice(&qtype.to_be_bytes());
    bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags_pack() -> Result<(), PackingError> {
        // Standard query, recursion desired
        let header = DnsHeaderPack {
            id: 0xBEEF,
            recursion_desired: true,
            question_count: 1,
            ..Default::default()
        };
        assert_eq!(
            [0xBE, 0xEF, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            header.pack_header()?
        );

        // Authoritative response with SERVFAIL
        let header = DnsHeaderPack {
            id: 0x0001,
            response: true,
            authoritative: true,
            rcode: 2.into(),
            ..Default::default()
        };
        assert_eq!(
            [0x00, 0x01, 0x84, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            header.pack_header()?
        );

        Ok(())
    }

    #[test]
    fn test_parse_query() -> Result<()> {
        let packet = encode_query(0x1234, "WWW.WebServer.com", TYPE_A);
        let query = DnsQuery::parse(&packet)?;

        assert_eq!(query.header.id, 0x1234);
        assert!(query.is_simple_query());
        assert_eq!(
            query.question,
            Some(DnsQuestion {
                name: "www.webserver.com".to_string(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            })
        );
        assert_eq!(query.question_bytes, packet[HEADER_LEN..].to_vec());

        Ok(())
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(DnsQuery::parse(&[0u8; 5]).is_err());

        let mut packet = encode_query(1, "example.com", TYPE_A);
        packet.truncate(packet.len() - 3);
        assert!(DnsQuery::parse(&packet).is_err());
    }

    #[test]
    fn test_build_answer() -> Result<()> {
        let query = DnsQuery::parse(&encode_query(0x0042, "webserver.com", TYPE_A))?;
        let answer = build_answer(&query, 300, Ipv4Addr::new(192, 168, 4, 7))?;

        let header = DnsHeaderPack::unpack_header(&answer)?;
        assert!(header.response);
        assert!(header.authoritative);
        assert!(header.recursion_desired);
        assert_eq!(header.id, 0x0042);
        assert_eq!(header.answer_count, 1);
        assert_eq!(*header.rcode, 0);

        let record = &answer[HEADER_LEN + query.question_bytes.len()..];
        assert_eq!(
            record,
            &[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x04, 192, 168, 4, 7]
        );

        Ok(())
    }

    #[test]
    fn test_build_error_is_header_only() -> Result<()> {
        let query = DnsQuery::parse(&encode_query(7, "example.org", TYPE_A))?;
        let reply = build_error(&query.header, 2)?;

        assert_eq!(reply.len(), HEADER_LEN);
        let header = DnsHeaderPack::unpack_header(&reply)?;
        assert!(header.response);
        assert_eq!(*header.rcode, 2);
        assert_eq!(header.question_count, 0);

        Ok(())
    }
}
