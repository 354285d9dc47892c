//! Control-protocol framing for the media relay: each datagram is a cookie,
//! a single space, and one bencoded dictionary. Only the handful of value
//! shapes the relay actually exchanges are supported.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NgValue {
    Str(String),
    Int(i64),
    List(Vec<NgValue>),
    Dict(BTreeMap<String, NgValue>),
}

impl NgValue {
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Outgoing relay command as an ordered key/value dictionary.
#[derive(Debug, Default, Clone)]
pub struct NgCommand {
    fields: BTreeMap<String, NgValue>,
}

impl NgCommand {
    pub fn new(command: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("command".to_string(), NgValue::str(command));
        Self { fields }
    }

    pub fn set(mut self, key: &str, value: NgValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn set_str(self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, NgValue::str(value))
    }

    pub fn encode(&self, cookie: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(cookie.as_bytes());
        out.push(b' ');
        encode_value(&NgValue::Dict(self.fields.clone()), &mut out);
        out
    }
}

/// Parsed relay reply envelope.
#[derive(Debug, Clone)]
pub struct NgReply {
    pub result: String,
    pub sdp: Option<String>,
    pub error_reason: Option<String>,
}

/// Split a reply datagram into its cookie and reply envelope.
pub fn decode_reply(datagram: &[u8]) -> Result<(String, NgReply)> {
    let space = datagram
        .iter()
        .position(|b| *b == b' ')
        .ok_or_else(|| Error::relay("reply missing cookie separator"))?;

    let cookie = std::str::from_utf8(&datagram[..space])
        .map_err(|_| Error::relay("reply cookie is not utf-8"))?
        .to_string();

    let mut cursor = Cursor::new(&datagram[space + 1..]);
    let value = cursor.parse_value()?;
    cursor.expect_end()?;

    let dict = match value {
        NgValue::Dict(dict) => dict,
        _ => return Err(Error::relay("reply body is not a dictionary")),
    };

    let result = dict
        .get("result")
        .and_then(NgValue::as_str)
        .ok_or_else(|| Error::relay("reply missing result field"))?
        .to_string();

    let sdp = dict.get("sdp").and_then(NgValue::as_str).map(str::to_string);
    let error_reason = dict
        .get("error-reason")
        .and_then(NgValue::as_str)
        .map(str::to_string);

    Ok((cookie, NgReply { result, sdp, error_reason }))
}

fn encode_value(value: &NgValue, out: &mut Vec<u8>) {
    match value {
        NgValue::Str(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s.as_bytes());
        }
        NgValue::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        NgValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        NgValue::Dict(fields) => {
            out.push(b'd');
            for (key, item) in fields {
                encode_value(&NgValue::str(key.clone()), out);
                encode_value(item, out);
            }
            out.push(b'e');
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::relay("truncated reply"))
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(Error::relay("trailing bytes after reply body"))
        }
    }

    fn parse_value(&mut self) -> Result<NgValue> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_str().map(NgValue::Str),
            other => Err(Error::Relay(format!("unexpected byte {other:#04x} in reply"))),
        }
    }

    fn parse_int(&mut self) -> Result<NgValue> {
        self.bump()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| Error::relay("invalid integer"))?;
        let value = digits
            .parse::<i64>()
            .map_err(|_| Error::relay("invalid integer"))?;
        self.bump()?; // 'e'
        Ok(NgValue::Int(value))
    }

    fn parse_str(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse::<usize>().ok())
            .ok_or_else(|| Error::relay("invalid string length"))?;
        self.pos += 1; // ':'
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::relay("truncated string"))?;
        let value = String::from_utf8(self.data[self.pos..end].to_vec())
            .map_err(|_| Error::relay("string is not utf-8"))?;
        self.pos = end;
        Ok(value)
    }

    fn parse_list(&mut self) -> Result<NgValue> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.bump()?; // 'e'
        Ok(NgValue::List(items))
    }

    fn parse_dict(&mut self) -> Result<NgValue> {
        self.bump()?; // 'd'
        let mut fields = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_str()?;
            let value = self.parse_value()?;
            fields.insert(key, value);
        }
        self.bump()?; // 'e'
        Ok(NgValue::Dict(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_with_sorted_keys() {
        let frame = NgCommand::new("offer")
            .set_str("call-id", "abc")
            .set_str("sdp", "v=0")
            .encode("c0ffee");

        assert_eq!(
            frame,
            b"c0ffee d7:call-id3:abc7:command5:offer3:sdp3:v=0e".to_vec()
        );
    }

    #[test]
    fn decodes_success_reply() {
        let (cookie, reply) = decode_reply(b"c0ffee d6:result2:ok3:sdp4:v=0\re").unwrap();
        assert_eq!(cookie, "c0ffee");
        assert_eq!(reply.result, "ok");
        assert_eq!(reply.sdp.as_deref(), Some("v=0\r"));
        assert!(reply.error_reason.is_none());
    }

    #[test]
    fn decodes_error_reply_with_reason() {
        let (_, reply) =
            decode_reply(b"x d12:error-reason10:no session6:result5:errore").unwrap();
        assert_eq!(reply.result, "error");
        assert_eq!(reply.error_reason.as_deref(), Some("no session"));
    }

    #[test]
    fn rejects_reply_without_cookie() {
        assert!(decode_reply(b"d6:result2:oke").is_err());
    }

    #[test]
    fn rejects_truncated_reply() {
        assert!(decode_reply(b"c0ffee d6:result2:ok").is_err());
    }

    #[test]
    fn roundtrips_nested_values() {
        let frame = NgCommand::new("offer")
            .set(
                "direction",
                NgValue::List(vec![NgValue::str("public"), NgValue::str("public")]),
            )
            .set("ttl", NgValue::Int(30))
            .encode("k");

        // The decoder only exposes the reply envelope, so parse the raw body.
        let mut cursor = Cursor::new(&frame[2..]);
        let value = cursor.parse_value().unwrap();
        cursor.expect_end().unwrap();
        match value {
            NgValue::Dict(fields) => {
                assert_eq!(fields.get("ttl"), Some(&NgValue::Int(30)));
                assert!(matches!(fields.get("direction"), Some(NgValue::List(items)) if items.len() == 2));
            }
            other => panic!("expected dict, got {other:?}"),
        }
    }
}
