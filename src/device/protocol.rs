//! Decoder for the single line payload sent by the device.
//!
//! A payload is one type tag byte followed by ASCII content, possibly padded with zero bytes by
//! the transport:
//!
//! - `D<digits>`: a distance in millimeters
//! - `M<text>`: a free text message
//!
//! Decoding is total. Anything that does not fit the grammar becomes `Reading::Invalid`.

use std::fmt;

use crate::device::constants::{TAG_DISTANCE, TAG_MESSAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Empty,
    NotANumber,
    UnknownType,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            InvalidReason::Empty => "empty",
            InvalidReason::NotANumber => "not-a-number",
            InvalidReason::UnknownType => "unknown-type",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Raw distance as reported by the device. Never scaled.
    Distance(u64),
    Message(String),
    Invalid { raw: String, reason: InvalidReason },
}

impl Reading {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Reading::Invalid { .. })
    }

    pub fn distance(&self) -> Option<u64> {
        match self {
            Reading::Distance(millimeters) => Some(*millimeters),
            _ => None,
        }
    }
}

// Every byte maps to exactly one char (latin-1), so no content is lost and decoding can not fail.
fn bytes_to_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| byte as char).collect()
}

fn parse_distance(content: &[u8]) -> Option<u64> {
    if content.is_empty() || !content.iter().all(u8::is_ascii_digit) {
        return None;
    }

    // only digits at this point, so the only possible failure is an overflow
    bytes_to_text(content).parse::<u64>().ok()
}

pub fn decode(bytes: &[u8]) -> Reading {
    let payload: Vec<u8> = bytes.iter().copied().filter(|&byte| byte != 0).collect();
    let raw = bytes_to_text(&payload);

    let Some((&tag, content)) = payload.split_first() else {
        return Reading::Invalid { raw, reason: InvalidReason::Empty };
    };

    match tag {
        TAG_DISTANCE => match parse_distance(content) {
            Some(millimeters) => Reading::Distance(millimeters),
            None => Reading::Invalid { raw, reason: InvalidReason::NotANumber },
        },
        TAG_MESSAGE => Reading::Message(bytes_to_text(content)),
        _ => Reading::Invalid { raw, reason: InvalidReason::UnknownType },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(raw: &str, reason: InvalidReason) -> Reading {
        Reading::Invalid { raw: raw.to_string(), reason }
    }

    #[test]
    fn decodes_distance() {
        assert_eq!(decode(b"D1234"), Reading::Distance(1234));
        assert_eq!(decode(b"D0"), Reading::Distance(0));
    }

    #[test]
    fn distance_is_not_scaled() {
        assert_eq!(decode(b"D1234567").distance(), Some(1234567));
    }

    #[test]
    fn rejects_malformed_distance() {
        assert_eq!(decode(b"D12a4"), invalid("D12a4", InvalidReason::NotANumber));
        assert_eq!(decode(b"D"), invalid("D", InvalidReason::NotANumber));
        assert_eq!(decode(b"D-5"), invalid("D-5", InvalidReason::NotANumber));
        assert_eq!(decode(b"D+5"), invalid("D+5", InvalidReason::NotANumber));
        assert_eq!(
            decode(b"D99999999999999999999999"),
            invalid("D99999999999999999999999", InvalidReason::NotANumber),
        );
    }

    #[test]
    fn decodes_message_verbatim() {
        assert_eq!(decode(b"Mhello"), Reading::Message("hello".to_string()));
        assert_eq!(decode(b"M"), Reading::Message(String::new()));
        assert_eq!(decode(b"M low battery "), Reading::Message(" low battery ".to_string()));
    }

    #[test]
    fn empty_payload() {
        assert_eq!(decode(b""), invalid("", InvalidReason::Empty));
        assert_eq!(decode(&[0, 0, 0]), invalid("", InvalidReason::Empty));
    }

    #[test]
    fn unknown_type() {
        assert_eq!(decode(b"X9"), invalid("X9", InvalidReason::UnknownType));
        assert_eq!(decode(b"d12"), invalid("d12", InvalidReason::UnknownType));
    }

    #[test]
    fn zero_bytes_are_not_significant() {
        assert_eq!(decode(b"D12\0\0\0"), decode(b"D12"));
        assert_eq!(decode(b"D1\x002\0"), Reading::Distance(12));
        assert_eq!(decode(b"\0M\0hi\0"), Reading::Message("hi".to_string()));
    }

    #[test]
    fn never_fails_on_arbitrary_bytes() {
        for first in 0..=255u8 {
            for second in [0u8, b'0', b'a', 0x80, 0xFF] {
                let reading = decode(&[first, second, 0xC3, 0x28]);
                if let Reading::Invalid { raw, .. } = &reading {
                    assert!(!raw.contains('\0'));
                }
            }
        }
    }

    #[test]
    fn reason_labels() {
        assert_eq!(InvalidReason::Empty.to_string(), "empty");
        assert_eq!(InvalidReason::NotANumber.to_string(), "not-a-number");
        assert_eq!(InvalidReason::UnknownType.to_string(), "unknown-type");
    }
}
