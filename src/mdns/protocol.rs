//! DNS wire format: header flags, questions, resource records.
//!
//! Pure functions only, no sockets. Names are read with compression pointer
//! support; names are always written uncompressed.

use std::io::{Cursor, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const QTYPE_ANY: u16 = 0xff;

pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
/// Wire length of a name, terminating zero byte included.
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_HOPS: usize = 64;

pub fn type_name(typ: u16) -> &'static str {
    match typ {
        TYPE_A => "A",
        TYPE_AAAA => "AAAA",
        TYPE_PTR => "PTR",
        TYPE_TXT => "TXT",
        TYPE_SRV => "SRV",
        QTYPE_ANY => "ANY",
        _ => "UNKNOWN",
    }
}

/// Second 16-bit word of the DNS header, unpacked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
}

impl Header {
    /// Pack into the flags word: QR | opcode(4) | AA | TC | RD | RA | Z(3) | rcode(4).
    pub fn flags(&self) -> u16 {
        let mut hi = 0u8;
        if self.response {
            hi |= 0x80;
        }
        hi |= (self.opcode & 0x0f) << 3;
        if self.authoritative {
            hi |= 0x04;
        }
        if self.truncated {
            hi |= 0x02;
        }
        if self.recursion_desired {
            hi |= 0x01;
        }
        let mut lo = self.rcode & 0x0f;
        if self.recursion_available {
            lo |= 0x80;
        }
        u16::from_be_bytes([hi, lo])
    }

    pub fn from_flags(id: u16, flags: u16) -> Self {
        let [hi, lo] = flags.to_be_bytes();
        Self {
            id,
            response: hi & 0x80 != 0,
            opcode: (hi >> 3) & 0x0f,
            authoritative: hi & 0x04 != 0,
            truncated: hi & 0x02 != 0,
            recursion_desired: hi & 0x01 != 0,
            recursion_available: lo & 0x80 != 0,
            rcode: lo & 0x0f,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub typ: u16,
    pub class: u16,
}

/// Decoded record data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(String),
    TXT(Vec<String>),
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub name: String,
    pub typ: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn a(name: &str, ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_owned(),
            typ: TYPE_A,
            class: CLASS_IN,
            ttl,
            data: RData::A(ip),
        }
    }

    pub fn aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_owned(),
            typ: TYPE_AAAA,
            class: CLASS_IN,
            ttl,
            data: RData::AAAA(ip),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

/// Write `name` as length-prefixed labels terminated by a zero byte.
/// Empty labels (leading, trailing or doubled dots) are skipped, so
/// `"host.local."` and `"host.local"` encode identically.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let mut total = 1;
    for seg in name.split('.').filter(|s| !s.is_empty()) {
        let bytes = seg.as_bytes();
        if bytes.len() > MAX_LABEL_LEN {
            anyhow::bail!("label '{}' longer than {} bytes", seg, MAX_LABEL_LEN);
        }
        total += bytes.len() + 1;
        if total > MAX_NAME_LEN {
            anyhow::bail!("name '{}' longer than {} bytes", name, MAX_NAME_LEN);
        }
        out.write_u8(bytes.len() as u8)?;
        out.write_all(bytes)?;
    }
    out.write_u8(0)?;
    Ok(())
}

/// Read a possibly compressed name at the cursor position. The cursor ends
/// up just past the name as it appears in place (after the first pointer,
/// if any). Every jump target is checked against the packet length and the
/// number of jumps is bounded, so malformed packets fail instead of looping.
pub fn read_name(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut total = 1usize;
    let mut hops = 0usize;
    let mut pos = cursor.position() as usize;
    let mut resume: Option<usize> = None;

    loop {
        let len = *data.get(pos).context("name runs past end of packet")?;
        if len == 0 {
            pos += 1;
            break;
        }
        match len & 0xc0 {
            0xc0 => {
                let low = *data
                    .get(pos + 1)
                    .context("compression pointer truncated")?;
                let target = (((len & 0x3f) as usize) << 8) | low as usize;
                if target >= data.len() {
                    anyhow::bail!("compression pointer {} outside packet of {} bytes", target, data.len());
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    anyhow::bail!("too many compression pointers");
                }
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                pos = target;
            }
            0x00 => {
                let start = pos + 1;
                let end = start + len as usize;
                let label = data.get(start..end).context("label runs past end of packet")?;
                total += label.len() + 1;
                if total > MAX_NAME_LEN {
                    anyhow::bail!("name longer than {} bytes", MAX_NAME_LEN);
                }
                labels.push(std::str::from_utf8(label)?.to_owned());
                pos = end;
            }
            _ => anyhow::bail!("unsupported label type 0x{:02x}", len),
        }
    }

    cursor.set_position(resume.unwrap_or(pos) as u64);
    Ok(labels.join("."))
}

fn read_exact_vec(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        anyhow::bail!("field of {} bytes truncated, {} left", len, remaining);
    }
    let mut buf = vec![0; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn parse_question(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Question> {
    let name = read_name(data, cursor)?;
    let typ = cursor.read_u16::<BigEndian>().context("question type truncated")?;
    let class = cursor.read_u16::<BigEndian>().context("question class truncated")?;
    Ok(Question { name, typ, class })
}

fn parse_txt(rdata: &[u8]) -> Result<Vec<String>> {
    let mut cursor = Cursor::new(rdata);
    let mut out = Vec::new();
    while (cursor.position() as usize) < rdata.len() {
        let len = cursor.read_u8()? as usize;
        let s = read_exact_vec(&mut cursor, len)?;
        out.push(String::from_utf8_lossy(&s).into_owned());
    }
    Ok(out)
}

fn parse_record(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Record> {
    let name = read_name(data, cursor)?;
    let typ = cursor.read_u16::<BigEndian>().context("record type truncated")?;
    let class = cursor.read_u16::<BigEndian>().context("record class truncated")?;
    let ttl = cursor.read_u32::<BigEndian>().context("record ttl truncated")?;
    let dlen = cursor.read_u16::<BigEndian>().context("record length truncated")? as usize;
    let rdata_start = cursor.position() as usize;
    let rdata = read_exact_vec(cursor, dlen)?;

    let data = match typ {
        TYPE_A => {
            let octets: [u8; 4] = rdata
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("A record with {} bytes of data", dlen))?;
            RData::A(Ipv4Addr::from(octets))
        }
        TYPE_AAAA => {
            let octets: [u8; 16] = rdata
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("AAAA record with {} bytes of data", dlen))?;
            RData::AAAA(Ipv6Addr::from(octets))
        }
        // PTR and SRV targets may point back into the packet, so they are
        // decoded against the whole buffer rather than the rdata slice.
        TYPE_PTR => {
            let mut c = Cursor::new(data);
            c.set_position(rdata_start as u64);
            RData::PTR(read_name(data, &mut c)?)
        }
        TYPE_SRV => {
            if dlen < 6 {
                anyhow::bail!("SRV record with {} bytes of data", dlen);
            }
            let mut c = Cursor::new(data);
            c.set_position(rdata_start as u64);
            let priority = c.read_u16::<BigEndian>()?;
            let weight = c.read_u16::<BigEndian>()?;
            let port = c.read_u16::<BigEndian>()?;
            let target = read_name(data, &mut c)?;
            RData::SRV {
                priority,
                weight,
                port,
                target,
            }
        }
        TYPE_TXT => RData::TXT(parse_txt(&rdata)?),
        _ => RData::Other(rdata),
    };

    Ok(Record {
        name,
        typ,
        class,
        ttl,
        data,
    })
}

pub fn parse_message(data: &[u8]) -> Result<Message> {
    if data.len() < HEADER_LEN {
        anyhow::bail!("DNS message too short: {} bytes", data.len());
    }
    let mut cursor = Cursor::new(data);
    let id = cursor.read_u16::<BigEndian>()?;
    let flags = cursor.read_u16::<BigEndian>()?;
    let nquestions = cursor.read_u16::<BigEndian>()?;
    let nanswers = cursor.read_u16::<BigEndian>()?;
    let nauthority = cursor.read_u16::<BigEndian>()?;
    let nadditional = cursor.read_u16::<BigEndian>()?;

    let mut msg = Message {
        header: Header::from_flags(id, flags),
        ..Default::default()
    };
    for _ in 0..nquestions {
        msg.questions.push(parse_question(data, &mut cursor)?);
    }
    for _ in 0..nanswers {
        msg.answers.push(parse_record(data, &mut cursor)?);
    }
    for _ in 0..nauthority {
        msg.authority.push(parse_record(data, &mut cursor)?);
    }
    for _ in 0..nadditional {
        msg.additional.push(parse_record(data, &mut cursor)?);
    }
    Ok(msg)
}

pub fn encode_txt(strings: &[String], out: &mut Vec<u8>) -> Result<()> {
    for s in strings {
        let bytes = &s.as_bytes()[..s.len().min(255)];
        out.write_u8(bytes.len() as u8)?;
        out.write_all(bytes)?;
    }
    Ok(())
}

pub fn encode_rdata(data: &RData, out: &mut Vec<u8>) -> Result<()> {
    match data {
        RData::A(ip) => out.write_all(&ip.octets())?,
        RData::AAAA(ip) => out.write_all(&ip.octets())?,
        RData::PTR(target) => encode_name(target, out)?,
        RData::TXT(strings) => encode_txt(strings, out)?,
        RData::SRV {
            priority,
            weight,
            port,
            target,
        } => {
            out.write_u16::<BigEndian>(*priority)?;
            out.write_u16::<BigEndian>(*weight)?;
            out.write_u16::<BigEndian>(*port)?;
            encode_name(target, out)?;
        }
        RData::Other(raw) => out.write_all(raw)?,
    }
    Ok(())
}

fn encode_record(rr: &Record, out: &mut Vec<u8>) -> Result<()> {
    encode_name(&rr.name, out)?;
    out.write_u16::<BigEndian>(rr.typ)?;
    out.write_u16::<BigEndian>(rr.class)?;
    out.write_u32::<BigEndian>(rr.ttl)?;
    let mut rdata = Vec::new();
    encode_rdata(&rr.data, &mut rdata)?;
    let dlen = u16::try_from(rdata.len()).context("record data too long")?;
    out.write_u16::<BigEndian>(dlen)?;
    out.write_all(&rdata)?;
    Ok(())
}

fn section_len(n: usize) -> Result<u16> {
    u16::try_from(n).context("too many entries in section")
}

pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    out.write_u16::<BigEndian>(msg.header.id)?;
    out.write_u16::<BigEndian>(msg.header.flags())?;
    out.write_u16::<BigEndian>(section_len(msg.questions.len())?)?;
    out.write_u16::<BigEndian>(section_len(msg.answers.len())?)?;
    out.write_u16::<BigEndian>(section_len(msg.authority.len())?)?;
    out.write_u16::<BigEndian>(section_len(msg.additional.len())?)?;

    for q in &msg.questions {
        encode_name(&q.name, &mut out)?;
        out.write_u16::<BigEndian>(q.typ)?;
        out.write_u16::<BigEndian>(q.class)?;
    }
    for rr in msg
        .answers
        .iter()
        .chain(msg.authority.iter())
        .chain(msg.additional.iter())
    {
        encode_record(rr, &mut out)?;
    }
    Ok(out)
}

/// Standard single-question query, as sent by a resolver.
pub fn create_query(name: &str, qtype: u16) -> Result<Vec<u8>> {
    encode_message(&Message {
        questions: vec![Question {
            name: name.to_owned(),
            typ: qtype,
            class: CLASS_IN,
        }],
        ..Default::default()
    })
}
