//! CRC-32C (Castagnoli) with the rotation mask applied to stored values.
//!
//! Every checksum written to disk is masked: storing a raw CRC next to the
//! bytes it covers invites the pathology where a file containing embedded
//! CRCs checksums to one of its own fields. Readers unmask before comparing.

use crc::{Crc, CRC_32_ISCSI};

/// CRC-32C instance shared by the table and log formats.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Computes the CRC-32C of `data`.
pub fn value(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Computes the CRC-32C of the concatenation of `a` and `b` without
/// materializing it.
pub fn value2(a: &[u8], b: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(a);
    digest.update(b);
    digest.finalize()
}

/// Returns a masked representation of `crc` suitable for storage.
pub fn mask(crc: u32) -> u32 {
    // Rotate right by 15 bits and add a constant.
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverts `mask`.
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}
