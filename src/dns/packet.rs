//! DNS message decoding, only as far as correlating a transaction needs.
//!
//! Reference: RFC 1035 section 4.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::layout::{DecodeError, Reader, Writer};

pub const HEADER_SIZE: usize = 12;
pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 255;
// A name cannot legitimately need more pointers than it has labels
const MAX_POINTERS: usize = 64;

pub fn qtype_name(qtype: u16) -> &'static str {
    match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        41 => "OPT",
        65 => "HTTPS",
        255 => "ANY",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
}

/// An address record from the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub ttl: u32,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub response: bool,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
}

impl DnsMessage {
    pub fn query(id: u16, name: &str, qtype: u16) -> Self {
        Self {
            id,
            response: false,
            rcode: 0,
            questions: vec![Question {
                name: name.to_string(),
                qtype,
            }],
            answers: Vec::new(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::new(buf);
        r.require(HEADER_SIZE)?;
        let id = r.be16(0)?;
        let flags = r.be16(2)?;
        let qdcount = r.be16(4)?;
        let ancount = r.be16(6)?;

        let mut pos = HEADER_SIZE;
        let mut questions = Vec::with_capacity(qdcount.min(8) as usize);
        for _ in 0..qdcount {
            let (name, next) = read_name(&r, pos)?;
            questions.push(Question {
                name,
                qtype: r.be16(next)?,
            });
            pos = next + 4;
        }

        let mut answers = Vec::new();
        for _ in 0..ancount {
            let (name, next) = read_name(&r, pos)?;
            let rtype = r.be16(next)?;
            let ttl = r.be32(next + 4)?;
            let rdlen = r.be16(next + 8)? as usize;
            let rdata = r.bytes(next + 10, rdlen)?;
            pos = next + 10 + rdlen;
            let addr = match (rtype, rdata.len()) {
                (TYPE_A, 4) => IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                (TYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(rdata);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                // CNAMEs and the like carry no address
                _ => continue,
            };
            answers.push(Answer { name, ttl, addr });
        }

        Ok(DnsMessage {
            id,
            response: flags & 0x8000 != 0,
            rcode: (flags & 0x000f) as u8,
            questions,
            answers,
        })
    }

    /// Encode without name compression.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(HEADER_SIZE);
        let mut flags = self.rcode as u16 & 0x000f;
        if self.response {
            flags |= 0x8000;
        }
        w.put_be16(0, self.id)
            .put_be16(2, flags)
            .put_be16(4, self.questions.len() as u16)
            .put_be16(6, self.answers.len() as u16);
        let mut pos = HEADER_SIZE;
        for q in &self.questions {
            pos = write_name(&mut w, pos, &q.name);
            w.put_be16(pos, q.qtype).put_be16(pos + 2, CLASS_IN);
            pos += 4;
        }
        for a in &self.answers {
            pos = write_name(&mut w, pos, &a.name);
            let (rtype, rdata) = match a.addr {
                IpAddr::V4(v4) => (TYPE_A, v4.octets().to_vec()),
                IpAddr::V6(v6) => (TYPE_AAAA, v6.octets().to_vec()),
            };
            w.put_be16(pos, rtype)
                .put_be16(pos + 2, CLASS_IN)
                .put_be16(pos + 4, (a.ttl >> 16) as u16)
                .put_be16(pos + 6, a.ttl as u16)
                .put_be16(pos + 8, rdata.len() as u16)
                .put_bytes(pos + 10, &rdata);
            pos += 10 + rdata.len();
        }
        w.into_inner()
    }

    /// Shortest TTL across the address answers.
    pub fn min_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|a| a.ttl).min()
    }
}

/// Read a possibly compressed name at `pos`. Returns the name and the
/// position right after it in the original record.
fn read_name(r: &Reader, pos: usize) -> Result<(String, usize), DecodeError> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut resume = None;
    let mut pointers = 0;
    loop {
        let len = r.u8(cursor)?;
        match len & 0xc0 {
            0x00 if len == 0 => {
                cursor += 1;
                break;
            }
            0x00 => {
                let label = r.bytes(cursor + 1, len as usize)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                if name.len() > MAX_NAME_LEN {
                    return Err(DecodeError::Invalid {
                        field: "dns name length",
                        value: name.len() as u64,
                    });
                }
                cursor += 1 + len as usize;
            }
            0xc0 => {
                let target = (r.be16(cursor)? & 0x3fff) as usize;
                pointers += 1;
                if pointers > MAX_POINTERS {
                    return Err(DecodeError::Invalid {
                        field: "dns compression pointer",
                        value: target as u64,
                    });
                }
                resume.get_or_insert(cursor + 2);
                cursor = target;
            }
            _ => {
                return Err(DecodeError::Invalid {
                    field: "dns label type",
                    value: len as u64,
                })
            }
        }
    }
    Ok((name, resume.unwrap_or(cursor)))
}

fn write_name(w: &mut Writer, mut pos: usize, name: &str) -> usize {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        w.put_u8(pos, label.len() as u8)
            .put_bytes(pos + 1, label.as_bytes());
        pos += 1 + label.len();
    }
    w.put_u8(pos, 0);
    pos + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> DnsMessage {
        DnsMessage {
            id: 0x1234,
            response: true,
            rcode: 0,
            questions: vec![Question {
                name: "example.com".to_string(),
                qtype: TYPE_A,
            }],
            answers: vec![
                Answer {
                    name: "example.com".to_string(),
                    ttl: 300,
                    addr: "93.184.216.34".parse().unwrap(),
                },
                Answer {
                    name: "example.com".to_string(),
                    ttl: 120,
                    addr: "2606:2800:220:1::1".parse().unwrap(),
                },
            ],
        }
    }

    #[test]
    fn test_decode_response() {
        let msg = DnsMessage::decode(&response().encode()).unwrap();
        assert_eq!(msg, response());
        assert_eq!(msg.min_ttl(), Some(120));
        assert_eq!(qtype_name(msg.questions[0].qtype), "A");
    }

    #[test]
    fn test_compressed_answer_name() {
        let mut buf = DnsMessage::query(7, "api.example.com", TYPE_A).encode();
        buf[2] = 0x81;
        buf[3] = 0x83;
        buf[7] = 1;
        // Answer name points back at the question name
        buf.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 30, 0, 4, 10, 0, 0, 1]);
        let msg = DnsMessage::decode(&buf).unwrap();
        assert!(msg.response);
        assert_eq!(msg.rcode, 3);
        assert_eq!(msg.answers[0].name, "api.example.com");
        assert_eq!(msg.answers[0].addr, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_pointer_loop_is_rejected() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[5] = 1;
        buf.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1]);
        assert!(DnsMessage::decode(&buf).is_err());
    }

    #[test]
    fn test_truncated_message() {
        let buf = response().encode();
        assert!(DnsMessage::decode(&buf[..buf.len() - 3]).is_err());
        assert!(DnsMessage::decode(&buf[..5]).is_err());
    }
}
