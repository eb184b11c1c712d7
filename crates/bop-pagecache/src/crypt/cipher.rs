//! AES-256-GCM page encryption.
//!
//! The page header stays in plaintext so a reader can find the key version
//! and page identity before decrypting. The body up to the tag slot is
//! encrypted in place and the tag is stored in the slot reserved in front of
//! the trailer (or at the very end of a compressed page). The nonce is the
//! tablespace iv mixed with the page number and LSN, so every page write
//! uses a fresh nonce.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};

use super::CryptError;
use crate::keyring::KeyBytes;
use crate::log::Lsn;
use crate::page::{
    self, FIL_PAGE_CRYPT_TAG_LEN, FIL_PAGE_DATA, FIL_PAGE_KEY_VERSION, FIL_PAGE_ORIGINAL_TYPE,
    FIL_PAGE_TYPE, PAGE_TYPE_ENCRYPTED, PageId,
};
use crate::tablespace::MasterKey;

const NONCE_LEN: usize = 12;

/// Format version written into master-key encrypted pages.
const MASTER_KEY_FORMAT: u8 = 1;
/// Algorithm byte of master-key encrypted pages.
const MASTER_KEY_ALGORITHM_AES_GCM: u8 = 1;

fn nonce_for(iv: &[u8], page_no: u32, lsn: Lsn) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&iv[..NONCE_LEN]);
    let mut salt = [0u8; NONCE_LEN];
    salt[..4].copy_from_slice(&page_no.to_be_bytes());
    salt[4..].copy_from_slice(&lsn.to_be_bytes());
    for (byte, mix) in nonce.iter_mut().zip(salt) {
        *byte ^= mix;
    }
    nonce
}

fn aad_for(id: PageId) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&id.space_id.to_be_bytes());
    aad[4..].copy_from_slice(&id.page_no.to_be_bytes());
    aad
}

fn tag_slot(image: &[u8], zip_size: Option<usize>) -> usize {
    match zip_size {
        Some(zip) => page::data_end(zip, true),
        None => page::data_end(image.len(), false),
    }
}

fn seal(
    image: &mut [u8],
    id: PageId,
    key: &KeyBytes,
    iv: &[u8],
    lsn: Lsn,
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    let tag_start = tag_slot(image, zip_size);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptError::Encrypt { page: id })?;
    let nonce = nonce_for(iv, id.page_no, lsn);
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &aad_for(id),
            &mut image[FIL_PAGE_DATA..tag_start],
        )
        .map_err(|_| CryptError::Encrypt { page: id })?;
    image[tag_start..tag_start + FIL_PAGE_CRYPT_TAG_LEN].copy_from_slice(tag.as_slice());
    Ok(())
}

fn open(
    image: &mut [u8],
    id: PageId,
    key: &KeyBytes,
    iv: &[u8],
    lsn: Lsn,
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    let tag_start = tag_slot(image, zip_size);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptError::Decrypt { page: id })?;
    let nonce = nonce_for(iv, id.page_no, lsn);
    let tag = Tag::clone_from_slice(&image[tag_start..tag_start + FIL_PAGE_CRYPT_TAG_LEN]);
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &aad_for(id),
            &mut image[FIL_PAGE_DATA..tag_start],
            &tag,
        )
        .map_err(|_| CryptError::Decrypt { page: id })?;
    image[tag_start..tag_start + FIL_PAGE_CRYPT_TAG_LEN].fill(0);
    Ok(())
}

/// Encrypts `image` with a rotated key and records `key_version` in it.
///
/// The LSN must already be stamped into the header.
pub fn encrypt_page(
    image: &mut [u8],
    id: PageId,
    key_version: u32,
    key: &KeyBytes,
    iv: &[u8],
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    page::write_u32(image, FIL_PAGE_KEY_VERSION, key_version);
    let lsn = page::page_lsn(image);
    seal(image, id, key, iv, lsn, zip_size)
}

/// Reverses [`encrypt_page`].
pub fn decrypt_page(
    image: &mut [u8],
    id: PageId,
    key: &KeyBytes,
    iv: &[u8],
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    let lsn = page::page_lsn(image);
    open(image, id, key, iv, lsn, zip_size)
}

/// Encrypts `image` with the tablespace master key, retyping it as
/// [`PAGE_TYPE_ENCRYPTED`].
pub fn encrypt_page_master_key(
    image: &mut [u8],
    id: PageId,
    master: &MasterKey,
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    let original_type = page::page_type(image);
    image[FIL_PAGE_KEY_VERSION] = MASTER_KEY_FORMAT;
    image[FIL_PAGE_KEY_VERSION + 1] = MASTER_KEY_ALGORITHM_AES_GCM;
    page::write_u16(image, FIL_PAGE_ORIGINAL_TYPE, original_type);
    page::write_u16(image, FIL_PAGE_TYPE, PAGE_TYPE_ENCRYPTED);
    let lsn = page::page_lsn(image);
    seal(image, id, &master.key, &master.iv, lsn, zip_size)
}

/// Reverses [`encrypt_page_master_key`], restoring the original page type.
pub fn decrypt_page_master_key(
    image: &mut [u8],
    id: PageId,
    master: &MasterKey,
    zip_size: Option<usize>,
) -> Result<(), CryptError> {
    if image[FIL_PAGE_KEY_VERSION + 1] != MASTER_KEY_ALGORITHM_AES_GCM {
        return Err(CryptError::Decrypt { page: id });
    }
    let lsn = page::page_lsn(image);
    open(image, id, &master.key, &master.iv, lsn, zip_size)?;
    let original_type = page::read_u16(image, FIL_PAGE_ORIGINAL_TYPE);
    page::write_u16(image, FIL_PAGE_TYPE, original_type);
    image[FIL_PAGE_KEY_VERSION..FIL_PAGE_KEY_VERSION + 8].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PAGE_TYPE_INDEX, init_header};

    fn plain_page(size: usize) -> Vec<u8> {
        let mut page = vec![0u8; size];
        init_header(&mut page, PageId::new(2, 9), PAGE_TYPE_INDEX);
        page::write_u64(&mut page, page::FIL_PAGE_LSN, 777);
        let end = page::data_end(size, false);
        for (i, byte) in page[FIL_PAGE_DATA..end].iter_mut().enumerate() {
            *byte = (i * 7 % 256) as u8;
        }
        page
    }

    #[test]
    fn rotated_key_round_trip() {
        let original = plain_page(4096);
        let mut image = original.clone();
        let key = [3u8; 32];
        let iv = [4u8; 16];
        encrypt_page(&mut image, PageId::new(2, 9), 5, &key, &iv, None).expect("encrypt");
        assert_eq!(page::read_u32(&image, FIL_PAGE_KEY_VERSION), 5);
        assert_ne!(&image[FIL_PAGE_DATA..100], &original[FIL_PAGE_DATA..100]);

        decrypt_page(&mut image, PageId::new(2, 9), &key, &iv, None).expect("decrypt");
        assert_eq!(&image[FIL_PAGE_DATA..], &original[FIL_PAGE_DATA..]);
    }

    #[test]
    fn wrong_key_fails() {
        let mut image = plain_page(4096);
        encrypt_page(&mut image, PageId::new(2, 9), 1, &[1u8; 32], &[0u8; 16], None).expect("encrypt");
        assert!(decrypt_page(&mut image, PageId::new(2, 9), &[2u8; 32], &[0u8; 16], None).is_err());
    }

    #[test]
    fn page_identity_is_authenticated() {
        let mut image = plain_page(4096);
        encrypt_page(&mut image, PageId::new(2, 9), 1, &[1u8; 32], &[0u8; 16], None).expect("encrypt");
        assert!(decrypt_page(&mut image, PageId::new(2, 10), &[1u8; 32], &[0u8; 16], None).is_err());
    }

    #[test]
    fn master_key_round_trip_restores_type() {
        let original = plain_page(2048);
        let mut image = original.clone();
        let master = MasterKey {
            key: [8u8; 32],
            iv: [1u8; 32],
        };
        encrypt_page_master_key(&mut image, PageId::new(2, 9), &master, Some(1024)).expect("encrypt");
        assert_eq!(page::page_type(&image), PAGE_TYPE_ENCRYPTED);
        assert_eq!(page::read_u16(&image, FIL_PAGE_ORIGINAL_TYPE), PAGE_TYPE_INDEX);

        decrypt_page_master_key(&mut image, PageId::new(2, 9), &master, Some(1024)).expect("decrypt");
        assert_eq!(page::page_type(&image), PAGE_TYPE_INDEX);
        assert_eq!(&image[FIL_PAGE_DATA..1008], &original[FIL_PAGE_DATA..1008]);
    }
}
