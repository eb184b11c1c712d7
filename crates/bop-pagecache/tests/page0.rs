use bop_pagecache::crypt::page0::{self, Page0Error, Page0Header};
use bop_pagecache::crypt::{CRYPT_IV_LEN, TABLESPACE_IV_LEN, read_page0};
use bop_pagecache::{CryptScheme, EncryptionMode, RotationMarker};
use rand::Rng;

const PAGE_SIZES: [usize; 3] = [4096, 8192, 16384];

fn random_header(rng: &mut impl Rng) -> Page0Header {
    let mut iv = [0u8; CRYPT_IV_LEN];
    rng.fill(&mut iv[..]);
    let migrating = rng.random_bool(0.5);
    let (rotation, tablespace_key, tablespace_iv) = if migrating {
        let mut key = [0u8; 32];
        let mut tablespace_iv = [0u8; TABLESPACE_IV_LEN];
        rng.fill(&mut key[..]);
        rng.fill(&mut tablespace_iv[..]);
        // A blank key reads back as absent.
        key[0] |= 1;
        tablespace_iv[0] |= 1;
        (RotationMarker::MasterKeyToRotatedKey, Some(key), Some(tablespace_iv))
    } else {
        (RotationMarker::NoRotation, None, None)
    };
    Page0Header {
        space_id: rng.random(),
        scheme: if rng.random_bool(0.5) {
            CryptScheme::Scheme1
        } else {
            CryptScheme::Unencrypted
        },
        min_key_version: rng.random_range(0..u32::MAX),
        key_id: rng.random(),
        encryption: match rng.random_range(0..3) {
            0 => EncryptionMode::Default,
            1 => EncryptionMode::On,
            _ => EncryptionMode::Off,
        },
        iv,
        rotation,
        tablespace_key,
        tablespace_iv,
    }
}

#[test]
fn random_headers_decode_to_what_was_encoded() {
    let mut rng = rand::rng();
    for round in 0..100 {
        let page_size = PAGE_SIZES[round % PAGE_SIZES.len()];
        let header = random_header(&mut rng);
        let flags: u32 = rng.random();
        let mut frame = vec![0u8; page_size];
        rng.fill(&mut frame[..]);

        page0::encode(&mut frame, &header, flags).unwrap();
        let decoded = page0::decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, header, "round {round}, page size {page_size}");
        assert_eq!(page0::read_flags(&frame), flags);

        let metadata = read_page0(&frame).unwrap().unwrap();
        assert_eq!(metadata.key_id(), header.key_id);
        assert_eq!(metadata.iv(), &header.iv);
        assert_eq!(metadata.scheme(), header.scheme);
        assert_eq!(metadata.min_key_version(), header.min_key_version);
        assert_eq!(metadata.page0_offset(), page0::page0_offset(page_size));
        assert_eq!(
            metadata.migration_master_key().is_some(),
            header.rotation == RotationMarker::MasterKeyToRotatedKey
        );
    }
}

#[test]
fn header_sits_past_the_descriptor_array() {
    for page_size in PAGE_SIZES {
        let offset = page0::page0_offset(page_size);
        assert!(offset + page0::PAGE0_HEADER_LEN < page_size - 8);
    }
    assert!(page0::page0_offset(16384) > page0::page0_offset(4096));
}

#[test]
fn page_without_magic_has_no_header() {
    for page_size in PAGE_SIZES {
        assert!(page0::decode(&vec![0u8; page_size]).unwrap().is_none());
        assert!(read_page0(&vec![0u8; page_size]).unwrap().is_none());
    }
}

#[test]
fn unknown_field_values_are_malformed() {
    let mut rng = rand::rng();
    let header = random_header(&mut rng);
    let mut frame = vec![0u8; 4096];
    page0::encode(&mut frame, &header, 0).unwrap();
    let offset = page0::page0_offset(4096);

    // magic(3) + iv length(2) + space id(4) + offset(2), then the scheme.
    let scheme_at = offset + 11;
    let mut bad_scheme = frame.clone();
    bad_scheme[scheme_at] = 9;
    assert!(matches!(page0::decode(&bad_scheme), Err(Page0Error::Malformed(_))));

    let mut bad_iv_len = frame.clone();
    bad_iv_len[offset + 4] = 3;
    assert!(matches!(page0::decode(&bad_iv_len), Err(Page0Error::Malformed(_))));

    let mut bad_offset = frame;
    bad_offset[offset + 10] ^= 0x40;
    assert!(matches!(page0::decode(&bad_offset), Err(Page0Error::Malformed(_))));
}

#[test]
fn tiny_frame_is_rejected() {
    let mut rng = rand::rng();
    let header = random_header(&mut rng);
    let mut frame = vec![0u8; 256];
    assert!(matches!(
        page0::encode(&mut frame, &header, 0),
        Err(Page0Error::PageTooSmall(256))
    ));
}
