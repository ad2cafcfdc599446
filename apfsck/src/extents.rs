//! Schema validator for extent reference tree leaf records.

use crate::catalog::J_TYPE_EXTENT;
use crate::error::{report, report_unknown, Result};
use crate::key::Key;

pub const PHYS_EXT_KEY_SIZE: usize = 8;
pub const PHYS_EXT_VAL_SIZE: usize = 20;

/// Low bits of len_and_kind hold the block count; the kind sits on top.
pub const PEXT_LEN_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const PEXT_KIND_SHIFT: u32 = 60;

/// The only extent kind written outside of snapshots.
const KIND_NEW: u8 = 1;

fn le64(raw: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        raw[off],
        raw[off + 1],
        raw[off + 2],
        raw[off + 3],
        raw[off + 4],
        raw[off + 5],
        raw[off + 6],
        raw[off + 7],
    ])
}

/// Validate one extent reference record.
///
/// Returns the last physical block covered by the extent; the walker stores
/// it back into its running key so that an extent starting inside this one
/// fails the ordering check on the next record.
pub(crate) fn parse_phys_ext_record(key: &Key, val: &[u8]) -> Result<u64> {
    if key.kind != J_TYPE_EXTENT {
        return Err(report("Extent reference tree", "wrong record type"));
    }
    if val.len() != PHYS_EXT_VAL_SIZE {
        return Err(report("Extent reference record", "wrong size of value"));
    }

    let len_and_kind = le64(val, 0);
    let blocks = len_and_kind & PEXT_LEN_MASK;
    let kind = (len_and_kind >> PEXT_KIND_SHIFT) as u8;

    if kind != KIND_NEW {
        return Err(report_unknown("Snapshots"));
    }
    if blocks == 0 {
        return Err(report("Extent reference record", "extent has no blocks"));
    }

    Ok(key.id + blocks - 1)
}
