//! Page identity, on-page field layout and checksums.
//!
//! Every page starts with a 38-byte file header and ends with an 8-byte
//! trailer:
//!
//! ```text
//! 0   checksum (new formula)       4   page number
//! 8   previous page                12  next page
//! 16  newest modification LSN      24  page type
//! 26  key version / flush LSN      34  space id
//! 38  page body ...
//! -24 encryption tag (16 bytes)
//! -8  old-formula checksum         -4  low 32 bits of the LSN
//! ```
//!
//! Compressed pages carry the same header but no trailer; their tag takes the
//! last 16 bytes.

use std::fmt;

use crc64fast_nvme::Digest;

use crate::log::Lsn;

pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0;
pub const FIL_PAGE_OFFSET: usize = 4;
pub const FIL_PAGE_PREV: usize = 8;
pub const FIL_PAGE_NEXT: usize = 12;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
/// Key version of a page encrypted with a rotated key; 0 when unencrypted.
pub const FIL_PAGE_KEY_VERSION: usize = 26;
/// Original page type of a master-key encrypted page.
pub const FIL_PAGE_ORIGINAL_TYPE: usize = 28;
pub const FIL_PAGE_SPACE_ID: usize = 34;
pub const FIL_PAGE_DATA: usize = 38;
/// Size of the trailer holding the old checksum and the low LSN bytes.
pub const FIL_PAGE_END_LSN_OLD_CHKSUM: usize = 8;
/// Bytes in front of the trailer reserved for the encryption tag.
pub const FIL_PAGE_CRYPT_TAG_LEN: usize = 16;

/// File-space header, stored in the body of page 0.
pub const FSP_HEADER_OFFSET: usize = FIL_PAGE_DATA;
pub const FSP_SIZE: usize = 8;
pub const FSP_FREE_LIMIT: usize = 12;
pub const FSP_SPACE_FLAGS: usize = 16;

pub const PAGE_TYPE_ALLOCATED: u16 = 0;
pub const PAGE_TYPE_TRX_SYS: u16 = 7;
pub const PAGE_TYPE_FSP_HDR: u16 = 8;
pub const PAGE_TYPE_XDES: u16 = 9;
pub const PAGE_TYPE_ENCRYPTED: u16 = 15;
pub const PAGE_TYPE_INDEX: u16 = 17855;

/// Page of the system tablespace holding the transaction system header.
pub const TRX_SYS_PAGE_NO: u32 = 5;

const HASH_RANDOM_MASK: u32 = 1_463_735_687;
const HASH_RANDOM_MASK2: u32 = 1_653_893_711;

/// `(space_id, page_no)`, unique across the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub space_id: u32,
    pub page_no: u32,
}

impl PageId {
    pub const fn new(space_id: u32, page_no: u32) -> Self {
        Self { space_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[space {}, page {}]", self.space_id, self.page_no)
    }
}

pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_be_bytes(bytes)
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// End of the usable page body of a page of `physical_size` bytes.
pub fn data_end(physical_size: usize, compressed: bool) -> usize {
    if compressed {
        physical_size - FIL_PAGE_CRYPT_TAG_LEN
    } else {
        physical_size - FIL_PAGE_END_LSN_OLD_CHKSUM - FIL_PAGE_CRYPT_TAG_LEN
    }
}

pub fn page_type(page: &[u8]) -> u16 {
    read_u16(page, FIL_PAGE_TYPE)
}

pub fn page_lsn(page: &[u8]) -> Lsn {
    read_u64(page, FIL_PAGE_LSN)
}

/// Writes the page identity into a freshly created page.
pub fn init_header(page: &mut [u8], id: PageId, page_type: u16) {
    write_u32(page, FIL_PAGE_OFFSET, id.page_no);
    write_u32(page, FIL_PAGE_PREV, u32::MAX);
    write_u32(page, FIL_PAGE_NEXT, u32::MAX);
    write_u16(page, FIL_PAGE_TYPE, page_type);
    write_u32(page, FIL_PAGE_SPACE_ID, id.space_id);
}

fn fold_crc64(value: u64) -> u32 {
    ((value >> 32) as u32) ^ (value as u32)
}

fn fold_pair(n1: u32, n2: u32) -> u32 {
    ((((n1 ^ n2 ^ HASH_RANDOM_MASK2) << 8).wrapping_add(n1)) ^ HASH_RANDOM_MASK).wrapping_add(n2)
}

/// New-formula checksum of an uncompressed page, stored at offset 0.
pub fn calc_new_checksum(page: &[u8]) -> u32 {
    let mut digest = Digest::new();
    digest.write(&page[FIL_PAGE_OFFSET..FIL_PAGE_KEY_VERSION]);
    digest.write(&page[FIL_PAGE_DATA..page.len() - FIL_PAGE_END_LSN_OLD_CHKSUM]);
    fold_crc64(digest.sum64())
}

/// Old-formula checksum, stored in the trailer.
///
/// Covers the header including the new checksum, so it is computed last.
pub fn calc_old_checksum(page: &[u8]) -> u32 {
    page[..FIL_PAGE_KEY_VERSION]
        .iter()
        .fold(0u32, |fold, byte| fold_pair(fold, u32::from(*byte)))
}

/// Checksum of a compressed page of `zip_size` bytes, stored at offset 0.
pub fn calc_zip_checksum(page: &[u8], zip_size: usize) -> u32 {
    let mut digest = Digest::new();
    digest.write(&page[FIL_PAGE_OFFSET..FIL_PAGE_LSN]);
    digest.write(&page[FIL_PAGE_TYPE..FIL_PAGE_KEY_VERSION]);
    digest.write(&page[FIL_PAGE_SPACE_ID..zip_size]);
    fold_crc64(digest.sum64())
}

/// Stamps `newest_lsn` into the header and trailer and writes checksums.
///
/// With `zip_size` set, only the first `zip_size` bytes form the page and
/// there is no trailer.
pub fn init_for_writing(page: &mut [u8], newest_lsn: Lsn, zip_size: Option<usize>) {
    write_u64(page, FIL_PAGE_LSN, newest_lsn);
    match zip_size {
        Some(zip_size) => {
            let checksum = calc_zip_checksum(page, zip_size);
            write_u32(page, FIL_PAGE_SPACE_OR_CHKSUM, checksum);
        }
        None => {
            let trailer = page.len() - FIL_PAGE_END_LSN_OLD_CHKSUM;
            write_u64(page, trailer, newest_lsn);
            let checksum = calc_new_checksum(page);
            write_u32(page, FIL_PAGE_SPACE_OR_CHKSUM, checksum);
            let old = calc_old_checksum(page);
            write_u32(page, trailer, old);
        }
    }
}

pub fn is_blank(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}

/// Verifies the checksums of a page image read from disk.
///
/// A never-written (all-zero) page is valid.
pub fn verify_checksum(page: &[u8], zip_size: Option<usize>) -> bool {
    match zip_size {
        Some(zip_size) => {
            let image = &page[..zip_size];
            is_blank(image)
                || read_u32(image, FIL_PAGE_SPACE_OR_CHKSUM) == calc_zip_checksum(image, zip_size)
        }
        None => {
            if is_blank(page) {
                return true;
            }
            let trailer = page.len() - FIL_PAGE_END_LSN_OLD_CHKSUM;
            read_u32(page, FIL_PAGE_SPACE_OR_CHKSUM) == calc_new_checksum(page)
                && read_u32(page, trailer) == calc_old_checksum(page)
        }
    }
}

/// Whether the low LSN bytes in the header match the copy in the trailer.
pub fn lsn_markers_match(page: &[u8]) -> bool {
    let len = page.len();
    page[FIL_PAGE_LSN + 4..FIL_PAGE_LSN + 8] == page[len - 4..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 4096;

    fn sample_page() -> Vec<u8> {
        let mut page = vec![0u8; SIZE];
        init_header(&mut page, PageId::new(3, 17), PAGE_TYPE_INDEX);
        for (i, byte) in page[FIL_PAGE_DATA..SIZE - 8].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        page
    }

    #[test]
    fn prepared_page_verifies() {
        let mut page = sample_page();
        init_for_writing(&mut page, 0x0102_0304_0506_0708, None);
        assert!(verify_checksum(&page, None));
        assert!(lsn_markers_match(&page));
        assert_eq!(page_lsn(&page), 0x0102_0304_0506_0708);
        assert_eq!(read_u32(&page, SIZE - 4), 0x0506_0708);
    }

    #[test]
    fn corrupted_body_fails_verification() {
        let mut page = sample_page();
        init_for_writing(&mut page, 99, None);
        page[2000] ^= 0x40;
        assert!(!verify_checksum(&page, None));
    }

    #[test]
    fn key_version_field_is_not_checksummed() {
        let mut page = sample_page();
        init_for_writing(&mut page, 99, None);
        let before = calc_new_checksum(&page);
        write_u32(&mut page, FIL_PAGE_KEY_VERSION, 12);
        assert_eq!(calc_new_checksum(&page), before);
    }

    #[test]
    fn blank_page_is_valid() {
        assert!(verify_checksum(&vec![0u8; SIZE], None));
        assert!(verify_checksum(&vec![0u8; SIZE], Some(1024)));
    }

    #[test]
    fn zip_checksum_covers_only_compressed_length() {
        let mut page = sample_page();
        init_for_writing(&mut page, 42, Some(1024));
        assert!(verify_checksum(&page, Some(1024)));
        page[3000] ^= 1;
        assert!(verify_checksum(&page, Some(1024)));
        page[500] ^= 1;
        assert!(!verify_checksum(&page, Some(1024)));
    }

    #[test]
    fn lsn_marker_mismatch_is_detected() {
        let mut page = sample_page();
        init_for_writing(&mut page, 1_000, None);
        write_u32(&mut page, SIZE - 4, 7);
        assert!(!lsn_markers_match(&page));
    }

    #[test]
    fn old_checksum_depends_on_new_one() {
        let mut page = sample_page();
        init_for_writing(&mut page, 5, None);
        let old = calc_old_checksum(&page);
        page[FIL_PAGE_SPACE_OR_CHKSUM] ^= 0xff;
        assert_ne!(calc_old_checksum(&page), old);
    }
}
