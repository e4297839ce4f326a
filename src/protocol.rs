// Copyright 2020 Joyent, Inc.

//! Line framing and command grammar.
//!
//! Requests are single lines, `NAME(param1,param2,...)`, with each
//! parameter either bare or double-quoted. Quoted parameters carry
//! Base64; quoting only delimits the value, it never decodes it.
//! Responses are `KEY="VALUE"` lines followed by a blank line and `EOF`.
//!
//! Binary push: after `BINARYPUSH("name")` the client sends, per batch,
//! one line holding a type template followed by exactly `size(template)`
//! raw bytes. A line of at most one byte ends the stream and the server
//! answers with a single ack byte.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::b64::{self, B64Error};
use crate::error::ProtocolError;
use crate::store::{IniParser, KeyValueStore};
use crate::template::TypeTemplate;

pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const MIN_BUFFER_SIZE: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;

pub const CMD_BINARYPUSH: &str = "BINARYPUSH";
pub const KEY_RETURN: &str = "RETURN";
pub const KEY_RETURNMSG: &str = "RETURNMSG";

/// Byte order of a peer, exchanged through `sys::endian`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Endian {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endian::Little => "LITTLE",
            Endian::Big => "BIG",
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endian {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Endian, ProtocolError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LITTLE" | "LE" | "L" => Ok(Endian::Little),
            "BIG" | "BE" | "B" => Ok(Endian::Big),
            other => Err(ProtocolError::Malformed(format!("unknown byte order {}", other))),
        }
    }
}

/// The one-byte answer that closes a binary push.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PushAck {
    Rejected = 0,
    Accepted = 1,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Bare(String),
    Encoded(String),
    Raw(Vec<u8>),
}

impl Param {
    pub fn bytes(&self) -> Result<Vec<u8>, B64Error> {
        match self {
            Param::Bare(s) => Ok(s.clone().into_bytes()),
            Param::Encoded(s) => b64::decode(s),
            Param::Raw(b) => Ok(b.clone()),
        }
    }

    pub fn text(&self) -> Result<String, B64Error> {
        String::from_utf8(self.bytes()?).map_err(|_| B64Error::InvalidEncoding)
    }

    /// The parameter as it appeared on the wire.
    pub fn wire(&self) -> String {
        match self {
            Param::Bare(s) => s.clone(),
            Param::Encoded(s) => format!("\"{}\"", s),
            Param::Raw(b) => format!("\"{}\"", b64::encode_value(b)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub name: String,
    pub params: Vec<Param>,
}

impl Request {
    pub fn new(name: &str, params: Vec<Param>) -> Request {
        Request {
            name: name.trim().to_ascii_uppercase(),
            params,
        }
    }

    /// A request whose parameters are Base64-encoded byte strings.
    pub fn encoded<P: AsRef<[u8]>>(name: &str, params: &[P]) -> Request {
        let params = params
            .iter()
            .map(|p| Param::Encoded(b64::encode_value(p.as_ref())))
            .collect();
        Request::new(name, params)
    }

    pub fn to_line(&self) -> String {
        let params: Vec<String> = self.params.iter().map(Param::wire).collect();
        format!("{}({})", self.name, params.join(","))
    }
}

/// Splits a request line into its upper-cased name and parameters.
pub fn parse_command(line: &str) -> Result<Request, ProtocolError> {
    let line = line.trim();
    let open = match line.find('(') {
        Some(i) => i,
        None => return parse_legacy(line),
    };

    let name = line[..open].trim();
    if name.is_empty() {
        return Err(ProtocolError::Malformed(line.to_string()));
    }
    let close = match line.rfind(')') {
        Some(i) if i > open => i,
        _ => return Err(ProtocolError::Malformed(line.to_string())),
    };
    if !line[close + 1..].trim().is_empty() {
        return Err(ProtocolError::Malformed(line.to_string()));
    }

    let params = split_params(&line[open + 1..close])
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    Ok(Request::new(name, params))
}

/// `NAME word word` requests, as typed by hand.
fn parse_legacy(line: &str) -> Result<Request, ProtocolError> {
    let mut words = line.split_whitespace();
    let name = words
        .next()
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    let params = words.map(|w| Param::Bare(w.to_string())).collect();
    Ok(Request::new(name, params))
}

fn split_params(body: &str) -> Option<Vec<Param>> {
    let mut params = Vec::new();
    if body.trim().is_empty() {
        return Some(params);
    }

    let mut chars = body.chars().peekable();
    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let param = if chars.peek() == Some(&'"') {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next()? {
                    '\\' => text.push(chars.next()?),
                    '"' => break,
                    c => text.push(c),
                }
            }
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            Param::Encoded(text)
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                text.push(c);
                chars.next();
            }
            Param::Bare(text.trim().to_string())
        };
        params.push(param);

        match chars.next() {
            Some(',') => continue,
            None => return Some(params),
            Some(_) => return None,
        }
    }
}

/// Newline-delimited framing with a cap on line length.
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> LineCodec {
        LineCodec {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    fn take_line(&mut self, buf: &mut BytesMut, end: usize) -> Result<String, ProtocolError> {
        self.next_index = 0;
        let mut line = buf.split_to(end);
        if buf.has_remaining() && buf[0] == b'\n' {
            buf.advance(1);
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        let start = self.next_index.min(buf.len());
        let found = buf[start..].iter().position(|b| *b == b'\n');
        match found {
            Some(offset) => {
                let end = start + offset;
                if end > self.max_length {
                    return Err(ProtocolError::LineTooLong(self.max_length));
                }
                self.take_line(buf, end).map(Some)
            }
            None if buf.len() > self.max_length => {
                Err(ProtocolError::LineTooLong(self.max_length))
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => {
                let end = buf.len();
                self.take_line(buf, end).map(Some)
            }
        }
    }
}

impl<'a> Encoder<&'a str> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: &'a str, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}

/// Buffered reader over a byte stream that yields lines and raw byte runs.
/// Bytes already buffered are never lost when a read times out.
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    codec: LineCodec,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, max_length: usize) -> LineReader<R> {
        LineReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: LineCodec::new(max_length),
            eof: false,
        }
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.codec.set_max_length(max_length);
    }

    pub fn max_length(&self) -> usize {
        self.codec.max_length()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Next line without its terminator, or `None` once the stream ends.
    pub fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            if let Some(line) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(line));
            }
            if self.eof {
                return self.codec.decode_eof(&mut self.buf);
            }
            match self.fill() {
                Ok(_) => (),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fills `out` completely, buffered bytes first. A read timeout does
    /// not abandon a partially received run.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < out.len() {
            if self.buf.is_empty() {
                if self.eof {
                    return Err(ProtocolError::UnexpectedEof);
                }
                match self.fill() {
                    Ok(_) => continue,
                    Err(e) => match e.kind() {
                        io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut => continue,
                        _ => return Err(e.into()),
                    },
                }
            }
            let n = self.buf.len().min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            self.codec.next_index = 0;
            filled += n;
        }
        Ok(())
    }
}

/// Writes `text` and a newline, blocking until every byte is sent.
pub fn write_line<W: Write>(out: &mut W, text: &str) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    LineCodec::new(usize::MAX).encode(text, &mut buf)?;
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

pub fn write_request<W: Write>(out: &mut W, request: &Request) -> Result<(), ProtocolError> {
    write_line(out, &request.to_line())
}

/// Writes `results` as a framed response: one `KEY="VALUE"` line per entry,
/// a blank line, then `EOF`.
pub fn write_response<W: Write>(
    out: &mut W,
    results: &KeyValueStore,
    clear_text: bool,
) -> Result<(), ProtocolError> {
    let mut buf = Vec::new();
    results.write_entries(&mut buf, !clear_text)?;
    buf.extend_from_slice(b"\nEOF\n");
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

/// Reads one framed response into `results`, always through its closing
/// `EOF`. Returns false when the response carried an `ERROR` line.
pub fn read_response<R: Read>(
    reader: &mut LineReader<R>,
    results: &KeyValueStore,
    decode_base64: bool,
) -> Result<bool, ProtocolError> {
    let mut parser = IniParser::new(results, decode_base64).until_eof();
    loop {
        let mut line = reader.read_line()?.ok_or(ProtocolError::UnexpectedEof)?;
        line.push('\n');
        if let Some(result) = parser.feed(&line) {
            return Ok(result);
        }
    }
}

/// One binary-push batch: the template line and its raw payload.
pub fn write_push_batch<W: Write>(
    out: &mut W,
    template: &TypeTemplate,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::with_capacity(data.len() + 64);
    LineCodec::new(usize::MAX).encode(template.to_string().as_str(), &mut buf)?;
    buf.put_slice(data);
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

/// Reads the next batch header. `None` is the end-of-stream marker.
pub fn read_push_header<R: Read>(
    reader: &mut LineReader<R>,
) -> Result<Option<String>, ProtocolError> {
    match reader.read_line()? {
        Some(line) if line.len() > 1 => Ok(Some(line)),
        Some(_) => Ok(None),
        None => Err(ProtocolError::UnexpectedEof),
    }
}
