//! DNS message encoding (RFC1035 4.1)
//!
//! Only what a stub resolver needs: building a single question query and reading the
//! question and answer sections of a response.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

#[rustfmt::skip]
mod consts {
    pub const DNS_HEADER_LEN:      usize = 12;
    pub const DNS_MAX_NAME_LEN:    usize = 255;
    pub const DNS_MAX_LABEL_LEN:   usize = 63;
    pub const DNS_MAX_JUMPS:       usize = 16;

    pub const DNS_FLAG_QR:         u16 = 0x8000;
    pub const DNS_FLAG_RD:         u16 = 0x0100;
    // Ignore AA and RA, the rest must be a plain recursive answer with RCODE 0
    pub const DNS_FLAG_CHECK_MASK: u16 = 0xfb7f;
    pub const DNS_FLAG_CHECK_OK:   u16 = 0x8100;

    pub const DNS_CLASS_IN:        u16 = 1;
}

pub use self::consts::DNS_HEADER_LEN;

/// Record types the resolver asks for or understands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    A,
    Cname,
    Aaaa,
    Other(u16),
}

impl RecordType {
    #[rustfmt::skip]
    pub fn as_u16(self) -> u16 {
        match self {
            RecordType::A        => 1,
            RecordType::Cname    => 5,
            RecordType::Aaaa     => 28,
            RecordType::Other(t) => t,
        }
    }

    #[rustfmt::skip]
    pub fn from_u16(t: u16) -> RecordType {
        match t {
            1  => RecordType::A,
            5  => RecordType::Cname,
            28 => RecordType::Aaaa,
            t  => RecordType::Other(t),
        }
    }
}

/// DNS message error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet truncated")]
    Truncated,
    #[error("label of {0} bytes is too long")]
    LabelTooLong(usize),
    #[error("name is longer than 255 bytes")]
    NameTooLong,
    #[error("invalid label length byte {0:#x}")]
    BadLabel(u8),
    #[error("compression pointer to {0} is out of the packet")]
    BadPointer(usize),
    #[error("too many compression pointers")]
    PointerLoop,
    #[error("compression pointer without a packet to resolve it")]
    MissingPacket,
    #[error("name is not valid UTF-8")]
    InvalidEncoding,
    #[error("message is not a response")]
    NotResponse,
}

/// Fixed message header
///
/// ```plain
/// +----------+-------+---------+---------+-----------+------------+
/// | TRANS ID | FLAGS | QDCOUNT | ANCOUNT | NSCOUNT   | ARCOUNT    |
/// +----------+-------+---------+---------+-----------+------------+
/// |    2     |   2   |    2    |    2    |     2     |     2      |
/// +----------+-------+---------+---------+-----------+------------+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub trans_id: u16,
    pub flags: u16,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl DnsHeader {
    pub fn read_from_slice(packet: &[u8]) -> Result<DnsHeader, WireError> {
        if packet.len() < consts::DNS_HEADER_LEN {
            return Err(WireError::Truncated);
        }

        let mut cur = &packet[..consts::DNS_HEADER_LEN];
        Ok(DnsHeader {
            trans_id: cur.get_u16(),
            flags: cur.get_u16(),
            question_count: cur.get_u16(),
            answer_count: cur.get_u16(),
            authority_count: cur.get_u16(),
            additional_count: cur.get_u16(),
        })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.trans_id);
        buf.put_u16(self.flags);
        buf.put_u16(self.question_count);
        buf.put_u16(self.answer_count);
        buf.put_u16(self.authority_count);
        buf.put_u16(self.additional_count);
    }
}

/// Encode a dotted name as length prefixed labels ending with a zero byte
///
/// Empty labels (leading, trailing or doubled dots) are skipped.
pub fn encode_name<B: BufMut>(name: &str, buf: &mut B) -> Result<(), WireError> {
    let mut encoded_len = 1;
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > consts::DNS_MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong(label.len()));
        }
        encoded_len += 1 + label.len();
        if encoded_len > consts::DNS_MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
    }

    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Decode a name starting at the beginning of `encoded`
///
/// Compression pointers are offsets from the start of `packet`. Returns the dotted
/// name and the number of bytes it occupies in `encoded`, a pointer always counting
/// as exactly 2 bytes no matter how long the name it refers to is.
pub fn decode_name(encoded: &[u8], packet: Option<&[u8]>) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    let consumed = decode_name_into(encoded, packet, &mut name, 0)?;
    Ok((name, consumed))
}

fn decode_name_into(encoded: &[u8], packet: Option<&[u8]>, name: &mut String, jumps: usize) -> Result<usize, WireError> {
    let mut pos = 0;
    loop {
        let len = *encoded.get(pos).ok_or(WireError::Truncated)?;
        if len == 0 {
            return Ok(pos + 1);
        }

        match len & 0xc0 {
            0x00 => {
                let len = len as usize;
                let label = encoded.get(pos + 1..pos + 1 + len).ok_or(WireError::Truncated)?;
                let label = std::str::from_utf8(label).map_err(|_| WireError::InvalidEncoding)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(label);
                if name.len() > consts::DNS_MAX_NAME_LEN {
                    return Err(WireError::NameTooLong);
                }
                pos += 1 + len;
            }
            0xc0 => {
                let packet = packet.ok_or(WireError::MissingPacket)?;
                if jumps >= consts::DNS_MAX_JUMPS {
                    return Err(WireError::PointerLoop);
                }
                let low = *encoded.get(pos + 1).ok_or(WireError::Truncated)?;
                let offset = (((len & 0x3f) as usize) << 8) | low as usize;
                if offset >= packet.len() {
                    return Err(WireError::BadPointer(offset));
                }
                decode_name_into(&packet[offset..], Some(packet), name, jumps + 1)?;
                return Ok(pos + 2);
            }
            _ => return Err(WireError::BadLabel(len)),
        }
    }
}

/// Build a recursive query with one question
pub fn build_query(trans_id: u16, hostname: &str, qtype: RecordType) -> Result<BytesMut, WireError> {
    let mut buf = BytesMut::with_capacity(consts::DNS_HEADER_LEN + hostname.len() + 2 + 4);

    let header = DnsHeader {
        trans_id,
        flags: consts::DNS_FLAG_RD,
        question_count: 1,
        ..Default::default()
    };
    header.write_to_buf(&mut buf);
    encode_name(hostname, &mut buf)?;
    buf.put_u16(qtype.as_u16());
    buf.put_u16(consts::DNS_CLASS_IN);

    Ok(buf)
}

/// What a response tells about its (first) question
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsResponse {
    pub trans_id: u16,
    /// Name of the first question
    pub hostname: String,
    /// Type of the first question
    pub question_type: Option<RecordType>,
    /// A and AAAA answers, in answer order
    pub addresses: Vec<IpAddr>,
    /// CNAME answers, not followed
    pub cnames: Vec<String>,
}

/// Parse a response
///
/// Responses with an error RCODE (or unexpected flags) are not parse failures, they
/// are returned with their question and no answers.
pub fn parse_response(packet: &[u8]) -> Result<DnsResponse, WireError> {
    let header = DnsHeader::read_from_slice(packet)?;
    if header.flags & consts::DNS_FLAG_QR == 0 {
        return Err(WireError::NotResponse);
    }

    let mut response = DnsResponse {
        trans_id: header.trans_id,
        ..Default::default()
    };

    let mut pos = consts::DNS_HEADER_LEN;
    for _ in 0..header.question_count {
        let (name, consumed) = decode_name(packet.get(pos..).ok_or(WireError::Truncated)?, Some(packet))?;
        pos += consumed;

        let mut fixed = packet.get(pos..pos + 4).ok_or(WireError::Truncated)?;
        let qtype = RecordType::from_u16(fixed.get_u16());
        pos += 4;

        if response.question_type.is_none() {
            response.hostname = name;
            response.question_type = Some(qtype);
        }
    }

    if header.flags & consts::DNS_FLAG_CHECK_MASK != consts::DNS_FLAG_CHECK_OK {
        return Ok(response);
    }

    for _ in 0..header.answer_count {
        let (_, consumed) = decode_name(packet.get(pos..).ok_or(WireError::Truncated)?, Some(packet))?;
        pos += consumed;

        // TYPE CLASS TTL RDLENGTH
        let mut fixed = packet.get(pos..pos + 10).ok_or(WireError::Truncated)?;
        let rtype = RecordType::from_u16(fixed.get_u16());
        let _class = fixed.get_u16();
        let _ttl = fixed.get_u32();
        let rdlen = fixed.get_u16() as usize;
        pos += 10;

        let rdata = packet.get(pos..pos + rdlen).ok_or(WireError::Truncated)?;
        match rtype {
            RecordType::A if rdlen == 4 => {
                response
                    .addresses
                    .push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            RecordType::Aaaa if rdlen == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                response.addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            RecordType::Cname => {
                let (cname, _) = decode_name(rdata, Some(packet))?;
                response.cnames.push(cname);
            }
            _ => {}
        }
        pos += rdlen;
    }

    Ok(response)
}
