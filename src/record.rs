//! Record and address codec.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::io;
use std::io::prelude::*;
use std::str::FromStr;

/// Byte separating the numeric key from the payload.
pub const SEPARATOR: u8 = b'.';

/// Record decoding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No `.` separator found in the record bytes.
    MissingSeparator,
    /// Nothing precedes the separator.
    EmptyKey,
    /// A key byte is not an ASCII digit.
    InvalidDigit(u8),
    /// The key does not fit into 64 bits.
    KeyOverflow,
    /// The payload is not valid text.
    Encoding,
}

impl Error for ParseError {}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ParseError::MissingSeparator => write!(f, "key separator not found"),
            ParseError::EmptyKey => write!(f, "record key is empty"),
            ParseError::InvalidDigit(byte) => write!(f, "invalid key digit: 0x{:02x}", byte),
            ParseError::KeyOverflow => write!(f, "record key overflows 64 bits"),
            ParseError::Encoding => write!(f, "record payload is not valid text"),
        }
    }
}

/// A single record: an unsigned numeric key and a text payload, serialized as `{key}.{payload}`.
///
/// Records are ordered by payload first (bytewise lexicographic), the key breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Record {
    pub key: u64,
    pub payload: String,
}

impl Record {
    pub fn new(key: u64, payload: impl Into<String>) -> Self {
        Record {
            key,
            payload: payload.into(),
        }
    }

    /// Decodes a record from its serialized bytes (without the line terminator).
    ///
    /// Digits before the first `.` are accumulated right to left into the key,
    /// everything after it becomes the payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let dot = bytes
            .iter()
            .position(|&b| b == SEPARATOR)
            .ok_or(ParseError::MissingSeparator)?;
        if dot == 0 {
            return Err(ParseError::EmptyKey);
        }

        let mut key: u64 = 0;
        let mut scale: Option<u64> = Some(1);
        for &byte in bytes[..dot].iter().rev() {
            if !byte.is_ascii_digit() {
                return Err(ParseError::InvalidDigit(byte));
            }
            let digit = (byte - b'0') as u64;
            if digit != 0 {
                let term = scale
                    .and_then(|scale| scale.checked_mul(digit))
                    .ok_or(ParseError::KeyOverflow)?;
                key = key.checked_add(term).ok_or(ParseError::KeyOverflow)?;
            }
            scale = scale.and_then(|scale| scale.checked_mul(10));
        }

        let payload = std::str::from_utf8(&bytes[dot + 1..]).map_err(|_| ParseError::Encoding)?;

        return Ok(Record {
            key,
            payload: payload.to_owned(),
        });
    }

    /// Serialized length in bytes: digits of the key, the separator and the payload.
    pub fn encoded_len(&self) -> usize {
        digit_count(self.key) + 1 + self.payload.len()
    }

    /// Checks that the payload is non-empty, not whitespace-only and free of `.`, `\r`, `\n` and `\0`.
    pub fn is_valid(&self) -> bool {
        if self.payload.trim().is_empty() {
            return false;
        }
        !self
            .payload
            .bytes()
            .any(|b| b == SEPARATOR || b == b'\r' || b == b'\n' || b == b'\0')
    }

    /// Appends the serialized record to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write!(writer, "{}.{}", self.key, self.payload)
    }
}

fn digit_count(mut value: u64) -> usize {
    let mut count = 1;
    while value >= 10 {
        value /= 10;
        count += 1;
    }
    count
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.payload)
    }
}

impl FromStr for Record {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Record::parse(s.as_bytes())
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.payload
            .as_bytes()
            .cmp(other.payload.as_bytes())
            .then(self.key.cmp(&other.key))
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Largest record start offset an [`Address`] can hold.
pub const MAX_POSITION: u64 = (1 << 48) - 1;

/// On-disk locator of a record: 48-bit byte offset and 16-bit serialized length
/// (line terminator excluded), packed into a single 64-bit word.
///
/// Two addresses are equal when they point at the same offset.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    position: u64,
    length: u16,
}

impl Address {
    pub fn new(position: u64, length: u16) -> Self {
        debug_assert!(position <= MAX_POSITION);
        Address { position, length }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn pack(&self) -> u64 {
        self.position << 16 | self.length as u64
    }

    pub fn unpack(raw: u64) -> Self {
        Address {
            position: raw >> 16,
            length: (raw & 0xFFFF) as u16,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.position.hash(state);
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{Address, ParseError, Record};

    #[test]
    fn test_parse_record() {
        let record: Record = "43545363.greshuiosderhghluirtd".parse().unwrap();

        assert_eq!(record.key, 43545363);
        assert_eq!(record.payload, "greshuiosderhghluirtd");
        assert!(record.is_valid());
    }

    #[test]
    fn test_parse_empty_payload() {
        let record: Record = "43545363.".parse().unwrap();

        assert_eq!(record.payload, "");
        assert!(!record.is_valid());
    }

    #[rstest]
    #[case(b"43545363", ParseError::MissingSeparator)]
    #[case(b"", ParseError::MissingSeparator)]
    #[case(b".abc", ParseError::EmptyKey)]
    #[case(b"12a4.abc", ParseError::InvalidDigit(b'a'))]
    #[case(b"18446744073709551616.abc", ParseError::KeyOverflow)]
    #[case(b"99999999999999999999.abc", ParseError::KeyOverflow)]
    fn test_parse_errors(#[case] bytes: &[u8], #[case] expected: ParseError) {
        assert_eq!(Record::parse(bytes), Err(expected));
    }

    #[test]
    fn test_parse_max_key() {
        let record = Record::parse(b"18446744073709551615.x").unwrap();
        assert_eq!(record.key, u64::MAX);

        let record = Record::parse(b"10000000000000000000.x").unwrap();
        assert_eq!(record.key, 10_000_000_000_000_000_000);
    }

    #[rstest]
    #[case("43545363.greshuiosder\nhghluirtd")]
    #[case("43545363.greshuiosderhg\rhluirtd")]
    #[case("43545363.greshuiosderhghluirtd\0")]
    #[case("43545363.greshuiosde.rhghluirtd")]
    #[case("1.   ")]
    #[case("1.\t")]
    fn test_invalid_payload(#[case] text: &str) {
        let record: Record = text.parse().unwrap();
        assert!(!record.is_valid());
    }

    #[rstest]
    #[case(Record::new(0, "a"))]
    #[case(Record::new(9, "abc def"))]
    #[case(Record::new(10, "x"))]
    #[case(Record::new(u64::MAX, "payload"))]
    fn test_serialize(#[case] record: Record) {
        let text = record.to_string();

        assert_eq!(text.len(), record.encoded_len());
        assert_eq!(text.parse::<Record>().unwrap(), record);

        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        assert_eq!(buf, text.as_bytes());
    }

    #[rstest]
    #[case(Record::new(33333333, "bar"), Record::new(11111111, "foo"))]
    #[case(Record::new(11111111, "foo"), Record::new(22222222, "foo"))]
    #[case(Record::new(99, "Zeta"), Record::new(1, "alpha"))]
    #[case(Record::new(5, "ab"), Record::new(1, "abc"))]
    fn test_ordering(#[case] lesser: Record, #[case] greater: Record) {
        assert!(lesser < greater);
        assert!(greater > lesser);
    }

    #[test]
    fn test_address_packing() {
        let address = Address::new(0x0000_1234_5678_9abc, 0xfedc);
        let raw = address.pack();

        assert_eq!(raw, 0x1234_5678_9abc_fedc);

        let restored = Address::unpack(raw);
        assert_eq!(restored.position(), 0x0000_1234_5678_9abc);
        assert_eq!(restored.length(), 0xfedc);
    }

    #[test]
    fn test_address_equality_by_position() {
        assert_eq!(Address::new(100, 5), Address::new(100, 7));
        assert_ne!(Address::new(100, 5), Address::new(101, 5));
    }
}
