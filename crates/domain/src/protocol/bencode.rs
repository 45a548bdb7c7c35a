//! Bencoding for tracker responses and extension-protocol payloads.

use std::collections::BTreeMap;

/// Bencoded value types
#[derive(Debug, Clone, PartialEq)]
pub enum BencodedValue {
    String(Vec<u8>),
    Int(i64),
    List(Vec<BencodedValue>),
    Dict(BTreeMap<Vec<u8>, BencodedValue>),
}

impl BencodedValue {
    pub fn get(&self, key: &str) -> Option<&BencodedValue> {
        match self {
            BencodedValue::Dict(dict) => dict.get(key.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        self.as_bytes().map(|s| String::from_utf8_lossy(s).into_owned())
    }

    pub fn as_list(&self) -> Option<&[BencodedValue]> {
        match self {
            BencodedValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodedValue::String(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            BencodedValue::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BencodedValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodedValue::Dict(dict) => {
                // BTreeMap keeps keys sorted as the encoding requires
                out.push(b'd');
                for (key, value) in dict {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Builds a dictionary from `(key, value)` pairs.
pub fn dict<I>(entries: I) -> BencodedValue
where
    I: IntoIterator<Item = (&'static str, BencodedValue)>,
{
    BencodedValue::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

/// Simple bencoding parser
pub struct BencodedParser<'a> {
    data: &'a [u8],
    position: usize,
    depth: usize,
}

const MAX_DEPTH: usize = 64;

impl<'a> BencodedParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            depth: 0,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn parse(&mut self) -> Result<BencodedValue, String> {
        if self.position >= self.data.len() {
            return Err("Unexpected end of data".to_string());
        }

        match self.data[self.position] {
            b'i' => self.parse_int(),
            b'l' => self.nested(Self::parse_list),
            b'd' => self.nested(Self::parse_dict),
            b'0'..=b'9' => self.parse_string(),
            _ => Err(format!("Invalid bencoded data at position {}", self.position)),
        }
    }

    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<BencodedValue, String>,
    ) -> Result<BencodedValue, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("Nesting too deep".to_string());
        }
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn parse_int(&mut self) -> Result<BencodedValue, String> {
        self.position += 1; // skip 'i'
        let end = self.find_byte(b'e')?;
        let int_str = std::str::from_utf8(&self.data[self.position..end])
            .map_err(|_| "Invalid integer encoding")?;
        let value = int_str
            .parse::<i64>()
            .map_err(|_| format!("Invalid integer value '{}'", int_str))?;
        self.position = end + 1;
        Ok(BencodedValue::Int(value))
    }

    fn parse_string(&mut self) -> Result<BencodedValue, String> {
        let colon_pos = self.find_byte(b':')?;
        let len_str = std::str::from_utf8(&self.data[self.position..colon_pos])
            .map_err(|_| "Invalid string length encoding")?;
        let len = len_str
            .parse::<usize>()
            .map_err(|_| "Invalid string length")?;

        self.position = colon_pos + 1;
        if len > self.data.len() - self.position {
            return Err("String length exceeds data bounds".to_string());
        }

        let value = self.data[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(BencodedValue::String(value))
    }

    fn parse_list(&mut self) -> Result<BencodedValue, String> {
        self.position += 1; // skip 'l'
        let mut list = Vec::new();

        while self.position < self.data.len() && self.data[self.position] != b'e' {
            list.push(self.parse()?);
        }

        if self.position >= self.data.len() {
            return Err("Unterminated list".to_string());
        }

        self.position += 1; // skip 'e'
        Ok(BencodedValue::List(list))
    }

    fn parse_dict(&mut self) -> Result<BencodedValue, String> {
        self.position += 1; // skip 'd'
        let mut dict = BTreeMap::new();

        while self.position < self.data.len() && self.data[self.position] != b'e' {
            let key = match self.parse()? {
                BencodedValue::String(k) => k,
                _ => return Err("Dictionary keys must be strings".to_string()),
            };
            let value = self.parse()?;
            dict.insert(key, value);
        }

        if self.position >= self.data.len() {
            return Err("Unterminated dictionary".to_string());
        }

        self.position += 1; // skip 'e'
        Ok(BencodedValue::Dict(dict))
    }

    fn find_byte(&self, byte: u8) -> Result<usize, String> {
        self.data[self.position..]
            .iter()
            .position(|&b| b == byte)
            .map(|pos| self.position + pos)
            .ok_or_else(|| format!("Expected '{}' not found", byte as char))
    }
}

/// Parses one complete value and rejects trailing bytes.
pub fn decode(data: &[u8]) -> Result<BencodedValue, String> {
    let mut parser = BencodedParser::new(data);
    let value = parser.parse()?;
    if parser.position() != data.len() {
        return Err(format!("Trailing data after position {}", parser.position()));
    }
    Ok(value)
}

/// Parses one value from the front of `data`, returning it with its length.
pub fn decode_prefix(data: &[u8]) -> Result<(BencodedValue, usize), String> {
    let mut parser = BencodedParser::new(data);
    let value = parser.parse()?;
    Ok((value, parser.position()))
}
