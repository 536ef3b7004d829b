use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

const BUNDLE_TAG: &[u8] = b"#bundle\0";
const MAX_BUNDLE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Float(f32),
    Int(i32),
    Bool(bool),
    Str(String),
    Long(i64),
    Double(f64),
    Blob(Vec<u8>),
    Nil,
    Impulse,
}

impl OscArg {
    pub fn type_tag(&self) -> char {
        match self {
            OscArg::Float(_) => 'f',
            OscArg::Int(_) => 'i',
            OscArg::Bool(true) => 'T',
            OscArg::Bool(false) => 'F',
            OscArg::Str(_) => 's',
            OscArg::Long(_) => 'h',
            OscArg::Double(_) => 'd',
            OscArg::Blob(_) => 'b',
            OscArg::Nil => 'N',
            OscArg::Impulse => 'I',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

#[derive(Debug, Error, PartialEq)]
pub enum OscError {
    #[error("address must start with '/': {0:?}")]
    InvalidAddress(String),
    #[error("packet truncated")]
    Truncated,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("type tag string missing")]
    MissingTypeTags,
    #[error("unsupported type tag {0:?}")]
    UnsupportedTag(char),
    #[error("bundle nesting too deep")]
    BundleTooDeep,
    #[error("blob of {0} bytes exceeds the osc size field")]
    BlobTooLarge(usize),
}

impl From<std::io::Error> for OscError {
    fn from(_: std::io::Error) -> Self {
        OscError::Truncated
    }
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    pub fn first_string(&self) -> Option<&str> {
        match self.args.first() {
            Some(OscArg::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OscError> {
        if !self.address.starts_with('/') {
            return Err(OscError::InvalidAddress(self.address.clone()));
        }

        let mut buf = Vec::with_capacity(64);
        write_padded_str(&mut buf, self.address.as_bytes());

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscArg::type_tag));
        write_padded_str(&mut buf, tags.as_bytes());

        for arg in &self.args {
            match arg {
                OscArg::Float(v) => buf.write_f32::<BigEndian>(*v)?,
                OscArg::Int(v) => buf.write_i32::<BigEndian>(*v)?,
                OscArg::Long(v) => buf.write_i64::<BigEndian>(*v)?,
                OscArg::Double(v) => buf.write_f64::<BigEndian>(*v)?,
                OscArg::Str(s) => write_padded_str(&mut buf, s.as_bytes()),
                OscArg::Blob(b) => {
                    buf.write_i32::<BigEndian>(size_field(b.len())?)?;
                    buf.extend_from_slice(b);
                    buf.resize(buf.len() + pad_len(b.len()), 0);
                }
                OscArg::Bool(_) | OscArg::Nil | OscArg::Impulse => {}
            }
        }
        Ok(buf)
    }
}

/// Decodes one datagram. Bundles are flattened into their messages, in order.
pub fn decode_packet(buf: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut out = Vec::new();
    decode_into(buf, 0, &mut out)?;
    Ok(out)
}

fn decode_into(buf: &[u8], depth: usize, out: &mut Vec<OscMessage>) -> Result<(), OscError> {
    if depth > MAX_BUNDLE_DEPTH {
        return Err(OscError::BundleTooDeep);
    }
    if buf.starts_with(BUNDLE_TAG) {
        let mut cur = Cursor::new(buf);
        cur.set_position(BUNDLE_TAG.len() as u64);
        // Time tag is ignored: everything is applied immediately.
        let _timetag = cur.read_u64::<BigEndian>()?;
        while (cur.position() as usize) < buf.len() {
            let size = cur.read_i32::<BigEndian>()?;
            let start = cur.position() as usize;
            let end = start
                .checked_add(usize::try_from(size).map_err(|_| OscError::Truncated)?)
                .filter(|&e| e <= buf.len())
                .ok_or(OscError::Truncated)?;
            decode_into(&buf[start..end], depth + 1, out)?;
            cur.set_position(end as u64);
        }
        return Ok(());
    }
    out.push(decode_message(buf)?);
    Ok(())
}

fn decode_message(buf: &[u8]) -> Result<OscMessage, OscError> {
    let mut cur = Cursor::new(buf);
    let address = read_padded_str(&mut cur)?;
    if !address.starts_with('/') {
        return Err(OscError::InvalidAddress(address));
    }

    // Some senders omit the type tag string entirely for argument-less messages.
    if cur.position() as usize >= buf.len() {
        return Ok(OscMessage::new(address, Vec::new()));
    }
    let tags = read_padded_str(&mut cur)?;
    let Some(tags) = tags.strip_prefix(',') else {
        return Err(OscError::MissingTypeTags);
    };

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'f' => OscArg::Float(cur.read_f32::<BigEndian>()?),
            'i' => OscArg::Int(cur.read_i32::<BigEndian>()?),
            'h' => OscArg::Long(cur.read_i64::<BigEndian>()?),
            'd' => OscArg::Double(cur.read_f64::<BigEndian>()?),
            's' => OscArg::Str(read_padded_str(&mut cur)?),
            'b' => {
                let len = usize::try_from(cur.read_i32::<BigEndian>()?)
                    .map_err(|_| OscError::Truncated)?;
                let mut blob = vec![0u8; len];
                cur.read_exact(&mut blob)?;
                skip(&mut cur, pad_len(len))?;
                OscArg::Blob(blob)
            }
            'T' => OscArg::Bool(true),
            'F' => OscArg::Bool(false),
            'N' => OscArg::Nil,
            'I' => OscArg::Impulse,
            other => return Err(OscError::UnsupportedTag(other)),
        };
        args.push(arg);
    }
    Ok(OscMessage::new(address, args))
}

fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn size_field(len: usize) -> Result<i32, OscError> {
    i32::try_from(len).map_err(|_| OscError::BlobTooLarge(len))
}

fn write_padded_str(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    // At least one terminating NUL, then pad to a four byte boundary.
    let total = bytes.len() + 1;
    buf.resize(buf.len() + 1 + pad_len(total), 0);
}

fn read_padded_str(cur: &mut Cursor<&[u8]>) -> Result<String, OscError> {
    let buf = *cur.get_ref();
    let start = cur.position() as usize;
    let rest = buf.get(start..).ok_or(OscError::Truncated)?;
    let nul = rest.iter().position(|&b| b == 0).ok_or(OscError::Truncated)?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| OscError::InvalidUtf8)?
        .to_string();
    let consumed = nul + 1 + pad_len(nul + 1);
    if start + consumed > buf.len() {
        return Err(OscError::Truncated);
    }
    cur.set_position((start + consumed) as u64);
    Ok(s)
}

fn skip(cur: &mut Cursor<&[u8]>, n: usize) -> Result<(), OscError> {
    let pos = cur.position() as usize + n;
    if pos > cur.get_ref().len() {
        return Err(OscError::Truncated);
    }
    cur.set_position(pos as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_pad_to_four_bytes_with_at_least_one_nul() {
        let mut buf = Vec::new();
        write_padded_str(&mut buf, b"/abc");
        assert_eq!(buf, b"/abc\0\0\0\0");

        let mut buf = Vec::new();
        write_padded_str(&mut buf, b"/ab");
        assert_eq!(buf, b"/ab\0");
    }

    #[test]
    fn float_message_matches_reference_bytes() {
        let msg = OscMessage::new("/a", vec![OscArg::Float(1.0)]);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, b"/a\0\0,f\0\0\x3f\x80\x00\x00");
    }

    #[test]
    fn bool_arguments_carry_no_payload() {
        let msg = OscMessage::new("/avatar/parameters/On", vec![OscArg::Bool(false)]);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 24 + 4);
        assert_eq!(decode_packet(&bytes).unwrap(), vec![msg]);
    }

    #[test]
    fn blob_size_must_fit_the_length_field() {
        assert_eq!(size_field(5), Ok(5));
        assert_eq!(size_field(i32::MAX as usize), Ok(i32::MAX));
        let too_big = i32::MAX as usize + 1;
        assert_eq!(size_field(too_big), Err(OscError::BlobTooLarge(too_big)));

        let msg = OscMessage::new("/b", vec![OscArg::Blob(vec![1, 2, 3, 4, 5])]);
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[8..12], &[0, 0, 0, 5]);
        assert_eq!(decode_packet(&bytes).unwrap(), vec![msg]);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let msg = OscMessage::new("/x", vec![OscArg::Int(7)]);
        let bytes = msg.encode().unwrap();
        assert_eq!(decode_packet(&bytes[..bytes.len() - 2]), Err(OscError::Truncated));
    }
}
