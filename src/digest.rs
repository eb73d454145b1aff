//! CRC32C header and data digests (RFC 3720 Section 12.1)
//!
//! Digests are carried on the wire as the little-endian bytes of the
//! CRC32C value. The data digest covers the data segment plus its zero
//! padding, so it is computed over the segment slices followed by the pad.

use crc32c::{crc32c, crc32c_append};

/// Length of a header or data digest on the wire
pub const DIGEST_LEN: usize = 4;

const ZERO_PAD: [u8; 3] = [0; 3];

/// Digest algorithm negotiated for one direction of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

impl DigestType {
    pub fn enabled(self) -> bool {
        self == DigestType::CRC32C
    }

    pub fn from_key(value: &str) -> Self {
        if value.split(',').any(|v| v.trim() == "CRC32C") {
            DigestType::CRC32C
        } else {
            DigestType::None
        }
    }

    pub fn as_key(self) -> &'static str {
        match self {
            DigestType::None => "None",
            DigestType::CRC32C => "CRC32C",
        }
    }
}

/// Header and data digest settings for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigestSettings {
    pub header: DigestType,
    pub data: DigestType,
}

impl DigestSettings {
    pub fn none() -> Self {
        DigestSettings::default()
    }

    pub fn crc32c() -> Self {
        DigestSettings {
            header: DigestType::CRC32C,
            data: DigestType::CRC32C,
        }
    }
}

/// Number of zero bytes needed to pad `len` to a 4-byte boundary
pub fn pad_len(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// `len` rounded up to a 4-byte boundary
pub fn padded(len: usize) -> usize {
    len + pad_len(len)
}

/// CRC32C over the basic header segment and any additional header segments
pub fn header_digest(bhs: &[u8], ahs: &[u8]) -> u32 {
    crc32c_append(crc32c(bhs), ahs)
}

/// CRC32C over a data segment split across `segments`, followed by `pad` zero bytes
pub fn data_digest<'a, I>(segments: I, pad: usize) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut crc = 0u32;
    for seg in segments {
        crc = crc32c_append(crc, seg);
    }
    if pad > 0 {
        crc = crc32c_append(crc, &ZERO_PAD[..pad.min(ZERO_PAD.len())]);
    }
    crc
}

/// Digest of a contiguous data segment
pub fn data_digest_of(data: &[u8]) -> u32 {
    data_digest(std::iter::once(data), pad_len(data.len()))
}

pub fn to_wire(digest: u32) -> [u8; DIGEST_LEN] {
    digest.to_le_bytes()
}

pub fn from_wire(bytes: [u8; DIGEST_LEN]) -> u32 {
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), 3);
        assert_eq!(pad_len(3), 1);
        assert_eq!(pad_len(4), 0);
        assert_eq!(padded(5), 8);
    }

    #[test]
    fn test_known_vector() {
        // RFC 3720 B.4: 32 bytes of zeros
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
    }

    #[test]
    fn test_split_segments_match_contiguous() {
        let data: Vec<u8> = (0..37u8).collect();
        let contiguous = data_digest_of(&data);
        let split = data_digest([&data[..10], &data[10..25], &data[25..]], pad_len(data.len()));
        assert_eq!(contiguous, split);
    }

    #[test]
    fn test_padding_changes_digest() {
        let data = [1u8, 2, 3];
        assert_ne!(data_digest_of(&data), crc32c(&data));
        let mut with_pad = data.to_vec();
        with_pad.push(0);
        assert_eq!(data_digest_of(&data), crc32c(&with_pad));
    }

    #[test]
    fn test_digest_key_parsing() {
        assert_eq!(DigestType::from_key("None"), DigestType::None);
        assert_eq!(DigestType::from_key("CRC32C,None"), DigestType::CRC32C);
        assert_eq!(DigestType::CRC32C.as_key(), "CRC32C");
    }
}
