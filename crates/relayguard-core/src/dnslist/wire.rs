//! Minimal RFC 1035 wire codec for the list frontend
//!
//! The frontend only ever answers single-question queries with A and
//! TXT records, so the codec covers exactly that: header, one question
//! (compression pointers accepted on parse), uncompressed answers.

use bytes::{Buf, BufMut};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Query types the frontend recognises
pub const QTYPE_A: u16 = 1;
pub const QTYPE_TXT: u16 = 16;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_ANY: u16 = 255;

pub const QCLASS_IN: u16 = 1;

/// Response codes used by the frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    Refused = 5,
    NotAuth = 9,
}

/// Parse failures; all map to FORMERR plus an abuse event
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated")]
    Truncated,

    #[error("malformed name")]
    BadName,

    #[error("not a query")]
    NotQuery,

    #[error("no question section")]
    NoQuestion,
}

/// One parsed question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    /// Lowercased dotted name without the trailing dot
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    pub recursion_desired: bool,
}

/// One answer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    A {
        name: String,
        addr: Ipv4Addr,
        ttl: u32,
    },
    Txt {
        name: String,
        text: String,
        ttl: u32,
    },
}

/// Parse the first question of a query packet
pub fn parse_query(packet: &[u8]) -> Result<Query, WireError> {
    if packet.len() < 12 {
        return Err(WireError::Truncated);
    }

    let mut buf = packet;
    let id = buf.get_u16();
    let flags = buf.get_u16();

    // QR must be 0 for a query
    if flags & 0x8000 != 0 {
        return Err(WireError::NotQuery);
    }
    let recursion_desired = flags & 0x0100 != 0;

    let qdcount = buf.get_u16();
    let _ancount = buf.get_u16();
    let _nscount = buf.get_u16();
    let _arcount = buf.get_u16();

    if qdcount == 0 {
        return Err(WireError::NoQuestion);
    }

    let mut offset = 12usize;
    let name = parse_name(packet, &mut offset)?;

    if packet.len() < offset + 4 {
        return Err(WireError::Truncated);
    }
    let qtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    let qclass = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]);

    Ok(Query {
        id,
        name,
        qtype,
        qclass,
        recursion_desired,
    })
}

/// Read a possibly-compressed name starting at `offset`
fn parse_name(packet: &[u8], offset: &mut usize) -> Result<String, WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = *offset;
    let mut jumped = false;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos).ok_or(WireError::Truncated)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            // Compression pointer; bounded to keep malicious loops out
            if jumps >= 4 {
                return Err(WireError::BadName);
            }
            let next = *packet.get(pos + 1).ok_or(WireError::Truncated)? as usize;
            let target = ((len & 0x3F) << 8) | next;
            if target >= packet.len() {
                return Err(WireError::BadName);
            }
            if !jumped {
                *offset = pos + 2;
            }
            pos = target;
            jumped = true;
            jumps += 1;
            continue;
        }

        if len > 63 {
            return Err(WireError::BadName);
        }

        let start = pos + 1;
        let end = start + len;
        let label = packet.get(start..end).ok_or(WireError::Truncated)?;
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        pos = end;

        if labels.len() > 128 {
            return Err(WireError::BadName);
        }
    }

    if !jumped {
        *offset = pos;
    }
    Ok(labels.join("."))
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        out.put_u8(len as u8);
        out.put_slice(&bytes[..len]);
    }
    out.put_u8(0);
}

/// Build a response packet for a parsed query
pub fn build_response(query: &Query, rcode: Rcode, answers: &[Answer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);

    out.put_u16(query.id);
    let mut flags: u16 = 0x8000 | 0x0400; // QR + AA
    if query.recursion_desired {
        flags |= 0x0100;
    }
    flags |= rcode as u16 & 0x000F;
    out.put_u16(flags);
    out.put_u16(1); // QDCOUNT
    out.put_u16(answers.len() as u16);
    out.put_u16(0); // NSCOUNT
    out.put_u16(0); // ARCOUNT

    put_name(&mut out, &query.name);
    out.put_u16(query.qtype);
    out.put_u16(query.qclass);

    for answer in answers {
        match answer {
            Answer::A { name, addr, ttl } => {
                put_name(&mut out, name);
                out.put_u16(QTYPE_A);
                out.put_u16(QCLASS_IN);
                out.put_u32(*ttl);
                out.put_u16(4);
                out.put_slice(&addr.octets());
            }
            Answer::Txt { name, text, ttl } => {
                put_name(&mut out, name);
                out.put_u16(QTYPE_TXT);
                out.put_u16(QCLASS_IN);
                out.put_u32(*ttl);
                let data = text.as_bytes();
                let len = data.len().min(255);
                out.put_u16(len as u16 + 1);
                out.put_u8(len as u8);
                out.put_slice(&data[..len]);
            }
        }
    }

    out
}

/// Build an error response directly from a raw packet's ID bytes, for
/// packets whose question never parsed
pub fn build_error_for_raw(packet: &[u8], rcode: Rcode) -> Vec<u8> {
    let id = if packet.len() >= 2 {
        u16::from_be_bytes([packet[0], packet[1]])
    } else {
        0
    };

    let mut out = Vec::with_capacity(12);
    out.put_u16(id);
    out.put_u16(0x8000 | (rcode as u16 & 0x000F));
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(id);
        out.put_u16(0x0100); // RD
        out.put_u16(1);
        out.put_u16(0);
        out.put_u16(0);
        out.put_u16(0);
        put_name(&mut out, name);
        out.put_u16(qtype);
        out.put_u16(QCLASS_IN);
        out
    }

    #[test]
    fn test_parse_query() {
        let packet = build_query(0x1234, "5.2.0.192.dnsbl.example.net", QTYPE_A);
        let query = parse_query(&packet).unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name, "5.2.0.192.dnsbl.example.net");
        assert_eq!(query.qtype, QTYPE_A);
        assert!(query.recursion_desired);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_query(&[0u8; 4]), Err(WireError::Truncated));

        let mut packet = build_query(1, "x.example", QTYPE_A);
        packet[2] |= 0x80; // QR bit set: a response, not a query
        assert_eq!(parse_query(&packet), Err(WireError::NotQuery));

        let mut packet = build_query(1, "x.example", QTYPE_A);
        packet[4] = 0;
        packet[5] = 0; // QDCOUNT 0
        assert_eq!(parse_query(&packet), Err(WireError::NoQuestion));
    }

    #[test]
    fn test_response_roundtrip_header() {
        let packet = build_query(7, "score.example.net", QTYPE_A);
        let query = parse_query(&packet).unwrap();

        let answers = vec![
            Answer::A {
                name: query.name.clone(),
                addr: "127.0.0.2".parse().unwrap(),
                ttl: 432_000,
            },
            Answer::Txt {
                name: query.name.clone(),
                text: "listed".to_string(),
                ttl: 432_000,
            },
        ];
        let response = build_response(&query, Rcode::NoError, &answers);

        assert_eq!(&response[0..2], &[0, 7]);
        assert_eq!(response[2] & 0x80, 0x80); // QR
        assert_eq!(response[3] & 0x0F, 0); // RCODE
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 2); // ANCOUNT
    }

    #[test]
    fn test_error_response_rcodes() {
        let packet = build_query(9, "x.example", QTYPE_A);
        let query = parse_query(&packet).unwrap();

        let response = build_response(&query, Rcode::NxDomain, &[]);
        assert_eq!(response[3] & 0x0F, 3);

        let response = build_response(&query, Rcode::NotAuth, &[]);
        assert_eq!(response[3] & 0x0F, 9);

        let response = build_error_for_raw(&packet, Rcode::FormErr);
        assert_eq!(&response[0..2], &[0, 9]);
        assert_eq!(response[3] & 0x0F, 1);
    }

    #[test]
    fn test_compressed_name_parse() {
        // Question name as a pointer to a name stored after the header
        let mut packet = Vec::new();
        packet.put_u16(1);
        packet.put_u16(0x0100);
        packet.put_u16(1);
        packet.put_u16(0);
        packet.put_u16(0);
        packet.put_u16(0);
        // Stored name at offset 12
        let name_offset = packet.len();
        put_name(&mut packet, "ptr.example.net");
        // Question: pointer to it
        let question_offset = packet.len();
        packet.put_u8(0xC0);
        packet.put_u8(name_offset as u8);
        packet.put_u16(QTYPE_A);
        packet.put_u16(QCLASS_IN);

        let mut offset = question_offset;
        let name = parse_name(&packet, &mut offset).unwrap();
        assert_eq!(name, "ptr.example.net");
        assert_eq!(offset, question_offset + 2);
    }
}
