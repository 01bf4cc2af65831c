//! Property-based tests for payload authentication and batch application

use proptest::prelude::*;

use crate::code::Arch;
use crate::config::VerifierConfig;
use crate::crypto::Sha256Hash;
use crate::error::{result_code, ApplyError, ErrorCode, FormatError, PayloadError};
use crate::format::{iterate_patches, PatchLevel, PatchType, Salt, BODY_OFFSET, SALT_OFFSET};
use crate::patcher::{ImageBuffer, PatchEngine, PayloadImage};
use crate::testing::{record, PayloadBuilder, SIGNING_KEY};
use crate::verifier::PayloadVerifier;

const GAME: &str = "RMCPD00";
const BASE: u32 = 0x8000_0000;
const SALT: Salt = Salt([0x3C; 32]);

/// Signed payload with a couple of WRITE records
fn signed_payload() -> Vec<u8> {
    let mut payload = PayloadBuilder::new(GAME);
    let data = payload.data(b"\x60\x00\x00\x00\x4e\x80\x00\x20");
    payload
        .patches(&[
            record(PatchLevel::CRITICAL, PatchType::Write, BASE + 0x40, data, 4),
            record(
                PatchLevel::BUGFIX,
                PatchType::Write,
                BASE + 0x80,
                data + 4,
                4,
            ),
        ])
        .salt(SALT)
        .pad_to(0x240);
    payload.build()
}

/// Verifier trusting the test key
fn verifier() -> PayloadVerifier {
    PayloadVerifier::new(VerifierConfig::new(GAME), Sha256Hash, SIGNING_KEY.anchor()).unwrap()
}

/// One WRITE of `data` to its own 0x10-byte slot
#[derive(Debug, Clone)]
struct Write {
    /// Record level
    level: PatchLevel,
    /// Bytes to write, never zero
    data: Vec<u8>,
}

/// Writes at any level, including disabled and combined ones
fn write_strategy() -> impl Strategy<Value = Write> {
    (
        (0u8..0x20).prop_map(PatchLevel),
        prop::collection::vec(1u8..=0xFF, 1..=8),
    )
        .prop_map(|(level, data)| Write { level, data })
}

/// Unsigned payload holding `writes`, slot `i` at `BASE + i * 0x10`, plus any `extra` records
fn write_payload(writes: &[Write], extra: &[[u8; 16]]) -> (Vec<u8>, std::ops::Range<u32>) {
    let mut payload = PayloadBuilder::new(GAME);
    let mut records: Vec<[u8; 16]> = writes
        .iter()
        .enumerate()
        .map(|(i, write)| {
            let source = payload.data(&write.data);
            record(
                write.level,
                PatchType::Write,
                BASE + i as u32 * 0x10,
                source,
                write.data.len() as u32,
            )
        })
        .collect();
    records.extend_from_slice(extra);
    payload.patches(&records);
    (payload.unsigned(), payload.patch_list())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any single flipped bit makes the payload fail verification
    #[test]
    fn property_bit_flip_rejected(index in 0usize..0x240, bit in 0u8..8) {
        let mut bytes = signed_payload();
        bytes[index] ^= 1 << bit;
        let result = verifier().verify_payload(&bytes, &SALT, None);

        let expected = match index {
            0..=11 => ErrorCode::Stage1HeaderCheck,
            12..=15 => ErrorCode::Stage1LengthError,
            _ => ErrorCode::Stage1SignatureInvalid,
        };
        prop_assert_eq!(result_code(&result), expected.as_i32());
    }

    /// Extra or missing trailing bytes are a length error, never a signature check
    #[test]
    fn property_length_mismatch(delta in 1usize..0x40, grow in any::<bool>()) {
        let mut bytes = signed_payload();
        if grow {
            bytes.resize(bytes.len() + delta, 0);
        } else {
            bytes.truncate(bytes.len() - delta);
        }
        let result = verifier().verify_payload(&bytes, &SALT, None);
        prop_assert_eq!(result_code(&result), ErrorCode::Stage1LengthError.as_i32());
    }

    /// A patch list that is not a whole number of records is rejected before decoding
    #[test]
    fn property_misaligned_patch_list(
        start in (BODY_OFFSET as u32)..0x300,
        len in (1u32..0x100).prop_filter("not whole records", |len| len % 16 != 0),
    ) {
        let bytes = vec![0; 0x400];
        prop_assert!(
            matches!(
                iterate_patches(&bytes, start..start + len),
                Err(FormatError::Misaligned { .. })
            ),
            "expected a misaligned patch list"
        );
    }

    /// Exactly the records whose level is enabled reach the image
    #[test]
    fn property_level_gating(
        writes in prop::collection::vec(write_strategy(), 0..12),
        mask in 0u8..0x20,
    ) {
        let (bytes, list) = write_payload(&writes, &[]);
        let engine = PatchEngine::new(Arch::PowerPc.encoder()).with_mask(PatchLevel(mask));
        let mut image = ImageBuffer::zeroed(BASE, 0x1000);

        let records = iterate_patches(&bytes, list).unwrap();
        let summary = engine
            .apply(&mut image, &PayloadImage::unloaded(&bytes), records)
            .unwrap();

        let mut applied = 0;
        for (i, write) in writes.iter().enumerate() {
            let slot = &image.as_bytes()[i * 0x10..i * 0x10 + write.data.len()];
            if write.level.is_enabled(PatchLevel(mask)) {
                applied += 1;
                prop_assert_eq!(slot, &write.data[..]);
            } else {
                prop_assert!(slot.iter().all(|&b| b == 0));
            }
        }
        prop_assert_eq!(summary.applied, applied);
        prop_assert_eq!(summary.skipped, writes.len() - applied);
    }

    /// Applying the same payload twice leaves the image as applying it once
    #[test]
    fn property_apply_idempotent(writes in prop::collection::vec(write_strategy(), 1..12)) {
        let (bytes, list) = write_payload(&writes, &[]);
        let engine = PatchEngine::new(Arch::PowerPc.encoder()).with_mask(PatchLevel::OPTIONAL);
        let mut image = ImageBuffer::zeroed(BASE, 0x1000);
        let payload = PayloadImage::unloaded(&bytes);

        engine
            .apply(&mut image, &payload, iterate_patches(&bytes, list.clone()).unwrap())
            .unwrap();
        let once = image.as_bytes().to_vec();
        engine
            .apply(&mut image, &payload, iterate_patches(&bytes, list).unwrap())
            .unwrap();
        prop_assert_eq!(image.as_bytes(), &once[..]);
    }

    /// One record outside the permitted region means no record is applied
    #[test]
    fn property_out_of_region_changes_nothing(
        writes in prop::collection::vec(write_strategy(), 1..12),
        offset in 0u32..0x1000,
    ) {
        let stray = record(
            PatchLevel::CRITICAL,
            PatchType::Write,
            BASE + 0x1000 + (offset & !3),
            SALT_OFFSET as u32,
            4,
        );
        let (bytes, list) = write_payload(&writes, &[stray]);
        let engine = PatchEngine::new(Arch::PowerPc.encoder())
            .with_mask(PatchLevel::OPTIONAL)
            .with_regions(vec![BASE..BASE + 0x1000]);
        let mut image = ImageBuffer::zeroed(BASE, 0x2000);

        let result = engine.apply(
            &mut image,
            &PayloadImage::unloaded(&bytes),
            iterate_patches(&bytes, list).unwrap(),
        );
        prop_assert!(
            matches!(result, Err(PayloadError::Apply(ApplyError::OutOfRegion { .. }))),
            "expected an out-of-region error"
        );
        prop_assert!(image.as_bytes().iter().all(|&b| b == 0));
    }
}
