use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid frame: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RespError>;

/// One decoded RESP3 value. `Push` marks an unsolicited server message;
/// everything else is a reply to the oldest pending command.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Error(String),
    Array(Vec<RespValue>),
    Map(Vec<(RespValue, RespValue)>),
    Push(Vec<RespValue>),
}

impl RespValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RespValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Looks up a key in a map value by its text representation.
    pub fn map_get(&self, key: &str) -> Option<&RespValue> {
        match self {
            RespValue::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Serializes a command and its arguments as a RESP array of bulk strings.
///
/// Callers pre-stringify numbers and booleans; the wire format is
/// string-only and length prefixes make it binary safe without escaping.
pub fn encode_command<S: AsRef<str>>(command: &str, parameters: &[S]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(64);
    buffer.push(b'*');
    write_decimal(1 + parameters.len() as i64, &mut buffer);
    buffer.extend_from_slice(b"\r\n");
    write_bulk(command.as_bytes(), &mut buffer);
    for parameter in parameters {
        write_bulk(parameter.as_ref().as_bytes(), &mut buffer);
    }
    buffer
}

fn write_bulk(bytes: &[u8], buffer: &mut Vec<u8>) {
    buffer.push(b'$');
    write_decimal(bytes.len() as i64, buffer);
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(bytes);
    buffer.extend_from_slice(b"\r\n");
}

fn write_decimal(value: i64, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(value.to_string().as_bytes());
}

pub struct RespCodec;

impl RespCodec {
    /// Decodes one complete top-level value from the front of `buffer`,
    /// consuming exactly the bytes it spans. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame.
    pub fn decode(buffer: &mut BytesMut) -> Result<Option<RespValue>> {
        let data = buffer.as_ref();
        if data.is_empty() {
            return Ok(None);
        }
        let mut parser = Parser::new(data);
        match parser.parse_value()? {
            Some(value) => {
                let consumed = parser.position();
                buffer.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Accumulates incoming socket bytes and decodes RESP values as they
/// complete. Left-over bytes from a partial frame are retained for the
/// next read; one read may also carry several pipelined frames.
#[derive(Debug)]
pub struct MessageBuffer {
    buffer: BytesMut,
    max_capacity: usize,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(8 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_capacity: capacity,
        }
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Recompact once a large frame has inflated the allocation, so
        // capacity does not ratchet up for the connection's lifetime.
        if self.buffer.capacity() > self.max_capacity * 4 {
            let mut new_buffer = BytesMut::with_capacity(self.max_capacity);
            new_buffer.extend_from_slice(&self.buffer);
            self.buffer = new_buffer;
        }
    }

    pub fn try_decode(&mut self) -> Result<Option<RespValue>> {
        RespCodec::decode(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Recursive-descent parser over a borrowed byte slice with an explicit
/// cursor. One instance lives for exactly one decode invocation; nested
/// aggregates advance the same cursor so each value consumes exactly its
/// own byte span.
struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn parse_value(&mut self) -> Result<Option<RespValue>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let prefix = self.data[self.pos];
        match prefix {
            b'$' => self.parse_bulk(false),
            b'!' => self.parse_bulk(true),
            b'+' => self.parse_simple(false),
            b'-' => self.parse_simple(true),
            b':' => self.parse_integer(),
            b',' => self.parse_double(),
            b'#' => self.parse_boolean(),
            b'_' => self.parse_null(),
            b'%' => self.parse_map(),
            b'*' => self.parse_aggregate(RespValue::Array),
            // Sets keep wire order; no deduplication.
            b'~' => self.parse_aggregate(RespValue::Array),
            b'>' => self.parse_aggregate(RespValue::Push),
            other => Err(RespError::Invalid(format!(
                "unknown type prefix: 0x{:02x} '{}'",
                other, other as char
            ))),
        }
    }

    fn parse_bulk(&mut self, as_error: bool) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let len = match self.read_decimal_line()? {
            Some(value) => value,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        if len < 0 {
            return Ok(Some(RespValue::Null));
        }
        let len = len as usize;
        if self.pos + len > self.data.len() {
            self.pos = start;
            return Ok(None);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        if !self.consume_terminator()? {
            self.pos = start;
            return Ok(None);
        }
        let text = std::str::from_utf8(slice)
            .map_err(|_| RespError::Invalid("bulk string not UTF-8".to_string()))?
            .to_string();
        Ok(Some(if as_error {
            RespValue::Error(text)
        } else {
            RespValue::Text(text)
        }))
    }

    fn parse_simple(&mut self, as_error: bool) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let line = match self.read_line()? {
            Some(line) => line,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        let text = String::from_utf8(line.to_vec())
            .map_err(|_| RespError::Invalid("simple string not UTF-8".to_string()))?;
        Ok(Some(if as_error {
            RespValue::Error(text)
        } else {
            RespValue::Text(text)
        }))
    }

    fn parse_integer(&mut self) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        match self.read_decimal_line()? {
            Some(value) => Ok(Some(RespValue::Integer(value))),
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }

    fn parse_double(&mut self) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let line = match self.read_line()? {
            Some(line) => line,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        let text = std::str::from_utf8(line)
            .map_err(|_| RespError::Invalid("double not UTF-8".to_string()))?;
        let value = text
            .parse::<f64>()
            .map_err(|_| RespError::Invalid(format!("invalid double: {}", text)))?;
        Ok(Some(RespValue::Double(value)))
    }

    fn parse_boolean(&mut self) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let line = match self.read_line()? {
            Some(line) => line,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        match line {
            b"t" => Ok(Some(RespValue::Boolean(true))),
            b"f" => Ok(Some(RespValue::Boolean(false))),
            other => Err(RespError::Invalid(format!(
                "invalid boolean payload: {:?}",
                other
            ))),
        }
    }

    fn parse_null(&mut self) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        match self.read_line()? {
            Some(line) if line.is_empty() => Ok(Some(RespValue::Null)),
            Some(_) => Err(RespError::Invalid(
                "null must be '_' followed by CRLF".to_string(),
            )),
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }

    fn parse_map(&mut self) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let len = match self.read_decimal_line()? {
            Some(value) => value,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        if len < 0 {
            return Ok(Some(RespValue::Null));
        }
        let mut pairs = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let key = match self.parse_value()? {
                Some(value) => value,
                None => {
                    self.pos = start;
                    return Ok(None);
                }
            };
            let value = match self.parse_value()? {
                Some(value) => value,
                None => {
                    self.pos = start;
                    return Ok(None);
                }
            };
            pairs.push((key, value));
        }
        Ok(Some(RespValue::Map(pairs)))
    }

    fn parse_aggregate(
        &mut self,
        wrap: fn(Vec<RespValue>) -> RespValue,
    ) -> Result<Option<RespValue>> {
        let start = self.pos;
        self.pos += 1;
        let len = match self.read_decimal_line()? {
            Some(value) => value,
            None => {
                self.pos = start;
                return Ok(None);
            }
        };
        if len < 0 {
            return Ok(Some(RespValue::Null));
        }
        let mut items = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match self.parse_value()? {
                Some(value) => items.push(value),
                None => {
                    self.pos = start;
                    return Ok(None);
                }
            }
        }
        Ok(Some(wrap(items)))
    }

    fn read_decimal_line(&mut self) -> Result<Option<i64>> {
        let line = match self.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let text = std::str::from_utf8(line)
            .map_err(|_| RespError::Invalid("invalid decimal".to_string()))?;
        text.parse::<i64>()
            .map(Some)
            .map_err(|_| RespError::Invalid(format!("invalid decimal: {}", text)))
    }

    /// Reads up to the next line terminator. Either CR or LF ends a line;
    /// a CRLF pair is consumed as one terminator. A lone CR at the end of
    /// the buffer is not committed, since the LF may still be in flight.
    fn read_line(&mut self) -> Result<Option<&'a [u8]>> {
        let start = self.pos;
        let len = self.data.len();
        let mut idx = start;
        while idx < len {
            match self.data[idx] {
                b'\r' => {
                    if idx + 1 >= len {
                        return Ok(None);
                    }
                    let line = &self.data[start..idx];
                    self.pos = if self.data[idx + 1] == b'\n' {
                        idx + 2
                    } else {
                        idx + 1
                    };
                    return Ok(Some(line));
                }
                b'\n' => {
                    let line = &self.data[start..idx];
                    self.pos = idx + 1;
                    return Ok(Some(line));
                }
                _ => idx += 1,
            }
        }
        Ok(None)
    }

    /// Consumes the terminator after a bulk payload. Returns false when
    /// more bytes are needed.
    fn consume_terminator(&mut self) -> Result<bool> {
        match self.data.get(self.pos) {
            None => Ok(false),
            Some(b'\r') => match self.data.get(self.pos + 1) {
                None => Ok(false),
                Some(b'\n') => {
                    self.pos += 2;
                    Ok(true)
                }
                Some(_) => {
                    self.pos += 1;
                    Ok(true)
                }
            },
            Some(b'\n') => {
                self.pos += 1;
                Ok(true)
            }
            Some(other) => Err(RespError::Invalid(format!(
                "bulk payload not followed by CRLF, got 0x{:02x}",
                other
            ))),
        }
    }
}
