// Copyright 2020 Joyent, Inc.

//! Binary type templates.
//!
//! A template such as `int[5];{char[20];{double;double;double}[100]}[3];long`
//! describes the layout of a typed binary argument: a `;`-separated list
//! of fields, each either a scalar (`int`, `float`, `double`, `char`,
//! `byte`, `long`) or a `{...}` struct, optionally followed by a `[n]`
//! repeat count. Scalar sizes are fixed by the protocol:
//!
//! | kind             | bytes              |
//! |------------------|--------------------|
//! | `int`            | 4                  |
//! | `float`,`double` | 8                  |
//! | `char`,`byte`    | 1                  |
//! | `long`           | platform C `long`  |
//!
//! `float` travels promoted to an 8-byte double. Values are laid out in
//! the sender's native byte order; `reverse_byte_order` converts a buffer
//! between the two orders and is its own inverse.

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_long;
use std::sync::{Arc, OnceLock};

use byteorder::{ByteOrder, NativeEndian};
use parking_lot::Mutex;
use thiserror::Error;

pub const LONG_SIZE: usize = std::mem::size_of::<c_long>();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("empty type template")]
    Empty,
    #[error("expected a field at offset {0}")]
    ExpectedField(usize),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("unterminated struct opened at offset {0}")]
    UnterminatedStruct(usize),
    #[error("bad repeat count at offset {0}")]
    BadRepeatCount(usize),
    #[error("template size does not fit in memory")]
    TooLarge,
    #[error("unexpected input at offset {0}")]
    TrailingInput(usize),
    #[error("buffer holds {actual} bytes, template needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("expected a {expected} value, got {found}")]
    ValueMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("not enough values for template")]
    MissingValue,
    #[error("more values than the template has fields")]
    ExtraValues,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int,
    Float,
    Double,
    Char,
    Byte,
    Long,
}

impl ScalarKind {
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Int => 4,
            ScalarKind::Float | ScalarKind::Double => 8,
            ScalarKind::Char | ScalarKind::Byte => 1,
            ScalarKind::Long => LONG_SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Char => "char",
            ScalarKind::Byte => "byte",
            ScalarKind::Long => "long",
        }
    }

    fn from_name(name: &str) -> Option<ScalarKind> {
        match name.to_ascii_lowercase().as_str() {
            "int" => Some(ScalarKind::Int),
            "float" => Some(ScalarKind::Float),
            "double" => Some(ScalarKind::Double),
            "char" => Some(ScalarKind::Char),
            "byte" => Some(ScalarKind::Byte),
            "long" => Some(ScalarKind::Long),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Struct(Vec<Field>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub kind: FieldKind,
    pub count: usize,
}

impl Field {
    /// Size of a single element, ignoring the repeat count. Saturates
    /// rather than overflowing.
    pub fn element_size(&self) -> usize {
        self.checked_element_size().unwrap_or(usize::MAX)
    }

    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    fn checked_element_size(&self) -> Option<usize> {
        match &self.kind {
            FieldKind::Scalar(kind) => Some(kind.size()),
            FieldKind::Struct(fields) => checked_total(fields),
        }
    }

    fn checked_size(&self) -> Option<usize> {
        self.checked_element_size()?.checked_mul(self.count)
    }
}

fn checked_total(fields: &[Field]) -> Option<usize> {
    fields
        .iter()
        .try_fold(0usize, |total, f| total.checked_add(f.checked_size()?))
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            FieldKind::Scalar(kind) => write!(f, "{}", kind.name())?,
            FieldKind::Struct(fields) => {
                write!(f, "{{")?;
                write_fields(f, fields)?;
                write!(f, "}}")?;
            }
        }
        if self.count > 1 {
            write!(f, "[{}]", self.count)?;
        }
        Ok(())
    }
}

fn write_fields(f: &mut fmt::Formatter, fields: &[Field]) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            write!(f, ";")?;
        }
        write!(f, "{}", field)?;
    }
    Ok(())
}

/// A native value packed into, or unpacked from, a template field.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Double(f64),
    Char(u8),
    Byte(u8),
    Long(i64),
    /// Fills a whole `char[n]` or `byte[n]` field, NUL padded.
    Str(String),
    /// Fills a whole top-level field verbatim.
    Raw(Vec<u8>),
}

impl Value {
    fn describe(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::Byte(_) => "byte",
            Value::Long(_) => "long",
            Value::Str(_) => "string",
            Value::Raw(_) => "raw",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeTemplate {
    fields: Vec<Field>,
    size: usize,
}

const CACHE_LIMIT: usize = 256;

fn cache() -> &'static Mutex<HashMap<String, Arc<TypeTemplate>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<TypeTemplate>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl TypeTemplate {
    pub fn parse(template: &str) -> Result<TypeTemplate, TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        let mut parser = Parser {
            bytes: template.as_bytes(),
            pos: 0,
        };
        let fields = parser.sequence(None)?;
        let size = checked_total(&fields).ok_or(TemplateError::TooLarge)?;
        Ok(TypeTemplate { fields, size })
    }

    /// Parses `template`, reusing an earlier parse of the same string.
    /// Once the cache holds `CACHE_LIMIT` templates new ones are parsed
    /// but not kept.
    pub fn cached(template: &str) -> Result<Arc<TypeTemplate>, TemplateError> {
        let cache = cache();
        if let Some(t) = cache.lock().get(template) {
            return Ok(Arc::clone(t));
        }
        let parsed = Arc::new(TypeTemplate::parse(template)?);
        let mut cache = cache.lock();
        if cache.len() < CACHE_LIMIT {
            cache.insert(template.to_string(), Arc::clone(&parsed));
        }
        Ok(parsed)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Swaps every scalar in `buf` end for end, walking arrays and structs.
    pub fn reverse_byte_order(&self, buf: &mut [u8]) -> Result<(), TemplateError> {
        self.check_len(buf.len())?;
        let mut offset = 0;
        reverse_fields(&self.fields, buf, &mut offset);
        Ok(())
    }

    /// Packs `values` in native byte order, one buffer per top-level field.
    pub fn pack(&self, values: &[Value]) -> Result<Vec<Vec<u8>>, TemplateError> {
        let mut iter = values.iter().peekable();
        let mut out = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let mut buf = Vec::with_capacity(field.size());
            if let Some(Value::Raw(bytes)) = iter.peek() {
                if bytes.len() != field.size() {
                    return Err(TemplateError::SizeMismatch {
                        expected: field.size(),
                        actual: bytes.len(),
                    });
                }
                buf.extend_from_slice(bytes);
                iter.next();
            } else {
                pack_field(field, &mut iter, &mut buf)?;
            }
            out.push(buf);
        }

        if iter.next().is_some() {
            return Err(TemplateError::ExtraValues);
        }
        Ok(out)
    }

    /// Flattens a native-order buffer back into scalar values.
    pub fn unpack(&self, buf: &[u8]) -> Result<Vec<Value>, TemplateError> {
        self.check_len(buf.len())?;
        let mut values = Vec::new();
        let mut offset = 0;
        unpack_fields(&self.fields, buf, &mut offset, &mut values);
        Ok(values)
    }

    fn check_len(&self, actual: usize) -> Result<(), TemplateError> {
        let expected = self.size();
        if actual != expected {
            return Err(TemplateError::SizeMismatch { expected, actual });
        }
        Ok(())
    }
}

impl fmt::Display for TypeTemplate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_fields(f, &self.fields)
    }
}

/// Number of `;`-separated fields outside of any struct. An empty
/// template counts as one field.
pub fn count_top_level_fields(template: &str) -> usize {
    let mut depth = 0usize;
    let mut count = 1;
    for c in template.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => count += 1,
            _ => (),
        }
    }
    count
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).cloned()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
    }

    /// `open` is the offset of the enclosing `{`, if any.
    fn sequence(&mut self, open: Option<usize>) -> Result<Vec<Field>, TemplateError> {
        let mut fields = Vec::new();
        loop {
            fields.push(self.field()?);
            self.skip_ws();
            match (self.peek(), open) {
                (Some(b';'), _) => self.pos += 1,
                (Some(b'}'), Some(_)) => {
                    self.pos += 1;
                    return Ok(fields);
                }
                (None, None) => return Ok(fields),
                (None, Some(at)) => return Err(TemplateError::UnterminatedStruct(at)),
                (Some(_), _) => return Err(TemplateError::TrailingInput(self.pos)),
            }
        }
    }

    fn field(&mut self) -> Result<Field, TemplateError> {
        self.skip_ws();
        let kind = if self.peek() == Some(b'{') {
            let open = self.pos;
            self.pos += 1;
            FieldKind::Struct(self.sequence(Some(open))?)
        } else {
            let start = self.pos;
            while let Some(b) = self.peek() {
                if !b.is_ascii_alphabetic() {
                    break;
                }
                self.pos += 1;
            }
            if start == self.pos {
                return Err(TemplateError::ExpectedField(start));
            }
            let name = String::from_utf8_lossy(&self.bytes[start..self.pos]);
            let scalar = ScalarKind::from_name(&name)
                .ok_or_else(|| TemplateError::UnknownType(name.to_string()))?;
            FieldKind::Scalar(scalar)
        };

        self.skip_ws();
        let count = if self.peek() == Some(b'[') {
            self.repeat_count()?
        } else {
            1
        };

        Ok(Field { kind, count })
    }

    fn repeat_count(&mut self) -> Result<usize, TemplateError> {
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| TemplateError::BadRepeatCount(open))?;
        if self.peek() != Some(b']') || digits.is_empty() {
            return Err(TemplateError::BadRepeatCount(open));
        }
        self.pos += 1;
        let n: usize = digits
            .parse()
            .map_err(|_| TemplateError::BadRepeatCount(open))?;
        // [0] and [1] both mean a single element
        Ok(n.max(1))
    }
}

fn reverse_fields(fields: &[Field], buf: &mut [u8], offset: &mut usize) {
    for field in fields {
        match &field.kind {
            FieldKind::Scalar(kind) => {
                let size = kind.size();
                for _ in 0..field.count {
                    if size > 1 {
                        buf[*offset..*offset + size].reverse();
                    }
                    *offset += size;
                }
            }
            FieldKind::Struct(inner) => {
                for _ in 0..field.count {
                    reverse_fields(inner, buf, offset);
                }
            }
        }
    }
}

fn pack_field<'v, I>(
    field: &Field,
    iter: &mut std::iter::Peekable<I>,
    buf: &mut Vec<u8>,
) -> Result<(), TemplateError>
where
    I: Iterator<Item = &'v Value>,
{
    match &field.kind {
        FieldKind::Scalar(kind) => {
            if let (ScalarKind::Char, Some(Value::Str(s))) | (ScalarKind::Byte, Some(Value::Str(s))) =
                (*kind, iter.peek())
            {
                let bytes = s.as_bytes();
                let n = bytes.len().min(field.count);
                buf.extend_from_slice(&bytes[..n]);
                buf.resize(buf.len() + field.count - n, 0);
                iter.next();
                return Ok(());
            }
            for _ in 0..field.count {
                let value = iter.next().ok_or(TemplateError::MissingValue)?;
                write_scalar(*kind, value, buf)?;
            }
        }
        FieldKind::Struct(inner) => {
            for _ in 0..field.count {
                for f in inner {
                    pack_field(f, iter, buf)?;
                }
            }
        }
    }
    Ok(())
}

fn write_scalar(kind: ScalarKind, value: &Value, buf: &mut Vec<u8>) -> Result<(), TemplateError> {
    let mut tmp = [0u8; 8];
    match (kind, value) {
        (ScalarKind::Int, Value::Int(v)) => {
            NativeEndian::write_i32(&mut tmp, *v);
        }
        (ScalarKind::Float, Value::Float(v)) | (ScalarKind::Double, Value::Float(v)) => {
            NativeEndian::write_f64(&mut tmp, f64::from(*v));
        }
        (ScalarKind::Float, Value::Double(v)) | (ScalarKind::Double, Value::Double(v)) => {
            NativeEndian::write_f64(&mut tmp, *v);
        }
        (ScalarKind::Char, Value::Char(v))
        | (ScalarKind::Char, Value::Byte(v))
        | (ScalarKind::Byte, Value::Char(v))
        | (ScalarKind::Byte, Value::Byte(v)) => {
            tmp[0] = *v;
        }
        (ScalarKind::Long, Value::Long(v)) => write_long(&mut tmp, *v),
        (ScalarKind::Long, Value::Int(v)) => write_long(&mut tmp, i64::from(*v)),
        (kind, other) => {
            return Err(TemplateError::ValueMismatch {
                expected: kind.name(),
                found: other.describe(),
            })
        }
    }
    buf.extend_from_slice(&tmp[..kind.size()]);
    Ok(())
}

fn write_long(tmp: &mut [u8], v: i64) {
    if LONG_SIZE == 8 {
        NativeEndian::write_i64(tmp, v);
    } else {
        NativeEndian::write_i32(tmp, v as i32);
    }
}

fn read_long(buf: &[u8]) -> i64 {
    if LONG_SIZE == 8 {
        NativeEndian::read_i64(buf)
    } else {
        i64::from(NativeEndian::read_i32(buf))
    }
}

fn unpack_fields(fields: &[Field], buf: &[u8], offset: &mut usize, out: &mut Vec<Value>) {
    for field in fields {
        match &field.kind {
            FieldKind::Scalar(kind) => {
                for _ in 0..field.count {
                    let at = &buf[*offset..];
                    out.push(match kind {
                        ScalarKind::Int => Value::Int(NativeEndian::read_i32(at)),
                        ScalarKind::Float => Value::Float(NativeEndian::read_f64(at) as f32),
                        ScalarKind::Double => Value::Double(NativeEndian::read_f64(at)),
                        ScalarKind::Char => Value::Char(at[0]),
                        ScalarKind::Byte => Value::Byte(at[0]),
                        ScalarKind::Long => Value::Long(read_long(at)),
                    });
                    *offset += kind.size();
                }
            }
            FieldKind::Struct(inner) => {
                for _ in 0..field.count {
                    unpack_fields(inner, buf, offset, out);
                }
            }
        }
    }
}
