//! Crypto header stored in page 0 of every encrypted tablespace.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic "PSA"          3
//! iv length            2   always 16
//! space id             4
//! header offset        2
//! scheme               1
//! min key version      4
//! key id               4
//! encryption mode      1
//! iv                   16
//! rotation marker      4
//! tablespace key       32  zero unless migrating from the master key
//! tablespace iv        32  zero unless migrating from the master key
//! ```
//!
//! The header sits right behind the extent descriptor array so it never
//! overlaps space management data.

use thiserror::Error;

use super::{CryptScheme, EncryptionMode, RotationMarker};
use crate::keyring::{KEY_LEN, KeyBytes};
use crate::page::{self, FSP_HEADER_OFFSET, FSP_SPACE_FLAGS};

pub const CRYPT_MAGIC: [u8; 3] = *b"PSA";
pub const CRYPT_IV_LEN: usize = 16;
pub const TABLESPACE_IV_LEN: usize = 32;

/// Encoded length of the header.
pub const PAGE0_HEADER_LEN: usize =
    3 + 2 + 4 + 2 + 1 + 4 + 4 + 1 + CRYPT_IV_LEN + 4 + KEY_LEN + TABLESPACE_IV_LEN;

/// Start of the extent descriptor array in page 0.
const XDES_ARR_OFFSET: usize = 150;
const XDES_BITMAP_OFFSET: usize = 24;
const XDES_BITS_PER_PAGE: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Page0Error {
    #[error("page of {0} bytes cannot hold a crypto header")]
    PageTooSmall(usize),
    #[error("malformed crypto header: {0}")]
    Malformed(String),
}

/// Pages per extent for a given physical page size.
pub fn extent_pages(page_size: usize) -> usize {
    if page_size <= 16 * 1024 {
        (1 << 20) / page_size
    } else {
        64
    }
}

/// Offset of the crypto header inside page 0.
pub fn page0_offset(page_size: usize) -> usize {
    let extent = extent_pages(page_size);
    let xdes_size = XDES_BITMAP_OFFSET + (extent * XDES_BITS_PER_PAGE).div_ceil(8);
    XDES_ARR_OFFSET + xdes_size * (page_size / extent)
}

/// Decoded crypto header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page0Header {
    pub space_id: u32,
    pub scheme: CryptScheme,
    pub min_key_version: u32,
    pub key_id: u32,
    pub encryption: EncryptionMode,
    pub iv: [u8; CRYPT_IV_LEN],
    pub rotation: RotationMarker,
    pub tablespace_key: Option<KeyBytes>,
    pub tablespace_iv: Option<[u8; TABLESPACE_IV_LEN]>,
}

/// Serializes `header` into `frame` and records `flags` in the space header.
pub fn encode(frame: &mut [u8], header: &Page0Header, flags: u32) -> Result<(), Page0Error> {
    let offset = page0_offset(frame.len());
    if offset + PAGE0_HEADER_LEN > page::data_end(frame.len(), false) || offset > u16::MAX as usize {
        return Err(Page0Error::PageTooSmall(frame.len()));
    }
    page::write_u32(frame, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS, flags);

    let mut pos = offset;
    frame[pos..pos + 3].copy_from_slice(&CRYPT_MAGIC);
    pos += 3;
    page::write_u16(frame, pos, CRYPT_IV_LEN as u16);
    pos += 2;
    page::write_u32(frame, pos, header.space_id);
    pos += 4;
    page::write_u16(frame, pos, offset as u16);
    pos += 2;
    frame[pos] = header.scheme as u8;
    pos += 1;
    page::write_u32(frame, pos, header.min_key_version);
    pos += 4;
    page::write_u32(frame, pos, header.key_id);
    pos += 4;
    frame[pos] = header.encryption as u8;
    pos += 1;
    frame[pos..pos + CRYPT_IV_LEN].copy_from_slice(&header.iv);
    pos += CRYPT_IV_LEN;
    page::write_u32(frame, pos, header.rotation as u32);
    pos += 4;
    match &header.tablespace_key {
        Some(key) => frame[pos..pos + KEY_LEN].copy_from_slice(key),
        None => frame[pos..pos + KEY_LEN].fill(0),
    }
    pos += KEY_LEN;
    match &header.tablespace_iv {
        Some(iv) => frame[pos..pos + TABLESPACE_IV_LEN].copy_from_slice(iv),
        None => frame[pos..pos + TABLESPACE_IV_LEN].fill(0),
    }
    Ok(())
}

/// Parses the crypto header; `Ok(None)` when page 0 carries none.
pub fn decode(frame: &[u8]) -> Result<Option<Page0Header>, Page0Error> {
    let offset = page0_offset(frame.len());
    if offset + PAGE0_HEADER_LEN > frame.len() {
        return Err(Page0Error::PageTooSmall(frame.len()));
    }
    if frame[offset..offset + 3] != CRYPT_MAGIC {
        return Ok(None);
    }

    let mut pos = offset + 3;
    let iv_len = page::read_u16(frame, pos) as usize;
    if iv_len != CRYPT_IV_LEN {
        return Err(Page0Error::Malformed(format!("iv length {iv_len}")));
    }
    pos += 2;
    let space_id = page::read_u32(frame, pos);
    pos += 4;
    let stored_offset = page::read_u16(frame, pos) as usize;
    if stored_offset != offset {
        return Err(Page0Error::Malformed(format!(
            "header offset {stored_offset}, expected {offset}"
        )));
    }
    pos += 2;
    let scheme = CryptScheme::from_u8(frame[pos])
        .ok_or_else(|| Page0Error::Malformed(format!("scheme {}", frame[pos])))?;
    pos += 1;
    let min_key_version = page::read_u32(frame, pos);
    pos += 4;
    let key_id = page::read_u32(frame, pos);
    pos += 4;
    let encryption = EncryptionMode::from_u8(frame[pos])
        .ok_or_else(|| Page0Error::Malformed(format!("encryption mode {}", frame[pos])))?;
    pos += 1;
    let mut iv = [0u8; CRYPT_IV_LEN];
    iv.copy_from_slice(&frame[pos..pos + CRYPT_IV_LEN]);
    pos += CRYPT_IV_LEN;
    let marker = page::read_u32(frame, pos);
    let rotation = RotationMarker::from_u32(marker)
        .ok_or_else(|| Page0Error::Malformed(format!("rotation marker {marker}")))?;
    pos += 4;

    let key_bytes = &frame[pos..pos + KEY_LEN];
    let tablespace_key = (!page::is_blank(key_bytes)).then(|| {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(key_bytes);
        key
    });
    pos += KEY_LEN;
    let iv_bytes = &frame[pos..pos + TABLESPACE_IV_LEN];
    let tablespace_iv = (!page::is_blank(iv_bytes)).then(|| {
        let mut iv = [0u8; TABLESPACE_IV_LEN];
        iv.copy_from_slice(iv_bytes);
        iv
    });

    Ok(Some(Page0Header {
        space_id,
        scheme,
        min_key_version,
        key_id,
        encryption,
        iv,
        rotation,
        tablespace_key,
        tablespace_iv,
    }))
}

/// Space flags recorded in the space header of page 0.
pub fn read_flags(frame: &[u8]) -> u32 {
    page::read_u32(frame, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Page0Header {
        Page0Header {
            space_id: 42,
            scheme: CryptScheme::Scheme1,
            min_key_version: 7,
            key_id: 3,
            encryption: EncryptionMode::Default,
            iv: [9u8; CRYPT_IV_LEN],
            rotation: RotationMarker::NoRotation,
            tablespace_key: None,
            tablespace_iv: None,
        }
    }

    #[test]
    fn offsets_follow_extent_descriptor_array() {
        assert_eq!(page0_offset(16 * 1024), 10_390);
        assert_eq!(page0_offset(4 * 1024), 1_558);
        for size in [1024usize, 2048, 4096, 8192, 16384, 32768, 65536] {
            assert!(page0_offset(size) + PAGE0_HEADER_LEN <= page::data_end(size, false));
        }
    }

    #[test]
    fn header_layout_is_stable() {
        let mut frame = vec![0u8; 4096];
        encode(&mut frame, &header(), 0x2000).expect("encode");
        let at = page0_offset(4096);
        assert_eq!(&frame[at..at + 3], b"PSA");
        assert_eq!(&frame[at + 3..at + 5], &[0, 16]);
        assert_eq!(&frame[at + 5..at + 9], &[0, 0, 0, 42]);
        assert_eq!(page::read_u16(&frame, at + 9) as usize, at);
        assert_eq!(frame[at + 11], 1);
        assert_eq!(page::read_u32(&frame, at + 12), 7);
        assert_eq!(read_flags(&frame), 0x2000);
    }

    #[test]
    fn missing_magic_decodes_to_none() {
        let frame = vec![0u8; 16 * 1024];
        assert_eq!(decode(&frame).expect("decode"), None);
    }

    #[test]
    fn migration_key_round_trips() {
        let mut frame = vec![0u8; 8192];
        let mut h = header();
        h.rotation = RotationMarker::MasterKeyToRotatedKey;
        h.tablespace_key = Some([5u8; KEY_LEN]);
        h.tablespace_iv = Some([6u8; TABLESPACE_IV_LEN]);
        encode(&mut frame, &h, 0).expect("encode");
        assert_eq!(decode(&frame).expect("decode"), Some(h));
    }

    #[test]
    fn bad_scheme_is_malformed() {
        let mut frame = vec![0u8; 4096];
        encode(&mut frame, &header(), 0).expect("encode");
        frame[page0_offset(4096) + 11] = 9;
        assert!(matches!(decode(&frame), Err(Page0Error::Malformed(_))));
    }
}
