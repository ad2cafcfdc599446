//! Key decoding and ordering for the four B-tree flavors.
//!
//! On-disk keys are turned into a uniform in-memory [`Key`] so that the tree
//! walker and the query engine can share one comparison function. Catalog
//! keys carry a name for dentries, xattrs and snapshot names; the other
//! flavors only use the scalar fields.

use std::cmp::Ordering;

use crate::catalog::{
    J_TYPE_DIR_REC, J_TYPE_FILE_EXTENT, J_TYPE_SIBLING_LINK, J_TYPE_SNAP_NAME, J_TYPE_XATTR,
};
use crate::error::{report, Result};
use crate::unicode::Unicursor;

/// The record type lives in the top byte of a catalog key's id field.
pub const OBJ_TYPE_SHIFT: u32 = 60;
pub const OBJ_ID_MASK: u64 = (1 << OBJ_TYPE_SHIFT) - 1;

pub const KEY_HEADER_SIZE: usize = 8;
pub const OMAP_KEY_SIZE: usize = 16;
const DREC_HASHED_KEY_SIZE: usize = 12;
const XATTR_KEY_SIZE: usize = 10;
const FILE_EXTENT_KEY_SIZE: usize = 16;
const SIBLING_LINK_KEY_SIZE: usize = 16;

const NAME_LEN_MASK: u32 = 0x3FF;
const HASH_MASK: u32 = 0x3FFFFF;

/// In-memory form of a B-tree key, ordered by `(id, kind, number, name)`.
///
/// `number` holds whatever secondary scalar the flavor defines: the logical
/// address for file extents, the packed length-and-hash for dentries, the
/// sibling id for sibling links, and the transaction id for object map keys
/// (filled in by the caller from the raw key, see [`omap_key_xid`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Key {
    pub id: u64,
    pub kind: u8,
    pub number: u64,
    pub name: Option<String>,
}

impl Key {
    /// The key that [`crate::query::omap_lookup`] searches for: the mapping
    /// for @oid with the highest transaction id not above @xid.
    pub fn omap(oid: u64, xid: u64) -> Self {
        Key {
            id: oid,
            kind: 0,
            number: xid,
            name: None,
        }
    }

    /// The key that [`crate::query::extentref_lookup`] searches for.
    pub fn extentref(bno: u64) -> Self {
        Key {
            id: bno,
            kind: crate::catalog::J_TYPE_EXTENT,
            number: 0,
            name: None,
        }
    }
}

fn le16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn le32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

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

/// Parse an on-disk object map key: `(oid: u64, xid: u64)`, 16 bytes.
///
/// The xid is not part of the decoded key; walker and query fill `number`
/// from [`omap_key_xid`] when they need it for ordering.
pub fn read_omap_key(raw: &[u8]) -> Result<Key> {
    if raw.len() != OMAP_KEY_SIZE {
        return Err(report("Object map", "wrong size of key"));
    }
    Ok(Key {
        id: le64(raw, 0),
        kind: 0,
        number: 0,
        name: None,
    })
}

/// The transaction id of a raw object map key. The caller must have decoded
/// the key with [`read_omap_key`] first, which checks the size.
pub fn omap_key_xid(raw: &[u8]) -> u64 {
    le64(raw, 8)
}

/// Parse an on-disk extent reference key: just the 8-byte header, with the
/// physical address in the id field.
pub fn read_extentref_key(raw: &[u8]) -> Result<Key> {
    if raw.len() != KEY_HEADER_SIZE {
        return Err(report("Extent reference tree", "wrong size of key"));
    }
    let hdr = le64(raw, 0);
    Ok(Key {
        id: hdr & OBJ_ID_MASK,
        kind: (hdr >> OBJ_TYPE_SHIFT) as u8,
        number: 0,
        name: None,
    })
}

/// Parse an on-disk catalog key and check its internal consistency.
pub fn read_cat_key(raw: &[u8], case_insensitive: bool) -> Result<Key> {
    if raw.len() < KEY_HEADER_SIZE {
        return Err(report("Catalog", "key is too small"));
    }
    let hdr = le64(raw, 0);
    let id = hdr & OBJ_ID_MASK;
    let kind = (hdr >> OBJ_TYPE_SHIFT) as u8;

    match kind {
        J_TYPE_DIR_REC => read_dir_rec_key(raw, id, case_insensitive),
        J_TYPE_XATTR => read_name_key(raw, id, kind, "Xattr record"),
        J_TYPE_SNAP_NAME => read_name_key(raw, id, kind, "Snapshot name record"),
        J_TYPE_FILE_EXTENT => {
            if raw.len() != FILE_EXTENT_KEY_SIZE {
                return Err(report("Catalog", "wrong size of key for extent record"));
            }
            Ok(Key {
                id,
                kind,
                number: le64(raw, 8),
                name: None,
            })
        }
        J_TYPE_SIBLING_LINK => {
            if raw.len() != SIBLING_LINK_KEY_SIZE {
                return Err(report("Catalog", "wrong size of key for sibling link record"));
            }
            // The sibling id orders links for the same inode.
            Ok(Key {
                id,
                kind,
                number: le64(raw, 8),
                name: None,
            })
        }
        _ => {
            // All other key types are just the header.
            if raw.len() != KEY_HEADER_SIZE {
                return Err(report("Catalog", "wrong size of key for catalog record"));
            }
            Ok(Key {
                id,
                kind,
                number: 0,
                name: None,
            })
        }
    }
}

/// Extract the NUL-terminated name from a key tail. Returns the name and its
/// on-disk length (which counts the terminator).
fn name_from_tail<'a>(tail: &'a [u8], context: &'static str) -> Result<(&'a str, usize)> {
    let nul = match tail.iter().position(|&b| b == 0) {
        Some(pos) => pos,
        None => return Err(report(context, "name lacks NUL-termination")),
    };
    let name = std::str::from_utf8(&tail[..nul])
        .map_err(|_| report(context, "name is not valid UTF-8"))?;
    Ok((name, nul + 1))
}

fn read_dir_rec_key(raw: &[u8], id: u64, case_insensitive: bool) -> Result<Key> {
    if raw.len() < DREC_HASHED_KEY_SIZE + 1 {
        return Err(report("Catalog", "wrong size for directory record key"));
    }
    if raw[raw.len() - 1] != 0 {
        return Err(report("Catalog", "filename lacks NUL-termination"));
    }

    let name_len_and_hash = le32(raw, 8);
    let (name, name_len) = name_from_tail(&raw[DREC_HASHED_KEY_SIZE..], "Catalog")?;

    if name_len_and_hash != dentry_hash(name, case_insensitive) {
        return Err(report("Catalog", "corrupted dentry hash"));
    }
    // The on-disk filename length counts the NUL termination.
    if name_len != (name_len_and_hash & NAME_LEN_MASK) as usize {
        return Err(report("Catalog", "wrong name length in dentry key"));
    }
    if raw.len() != DREC_HASHED_KEY_SIZE + name_len {
        return Err(report("Catalog", "size of dentry key doesn't match the name length"));
    }

    Ok(Key {
        id,
        kind: J_TYPE_DIR_REC,
        number: name_len_and_hash as u64,
        name: Some(name.to_string()),
    })
}

/// Xattr and snapshot name keys share one layout: an 8-byte header, a 16-bit
/// name length, and the NUL-terminated name itself.
fn read_name_key(raw: &[u8], id: u64, kind: u8, context: &'static str) -> Result<Key> {
    if raw.len() < XATTR_KEY_SIZE + 1 {
        return Err(report(context, "wrong size of key"));
    }
    if raw[raw.len() - 1] != 0 {
        return Err(report(context, "name lacks NUL-termination"));
    }

    let stored_len = le16(raw, 8) as usize;
    let (name, name_len) = name_from_tail(&raw[XATTR_KEY_SIZE..], context)?;

    if name_len != stored_len {
        return Err(report(context, "wrong name length in key"));
    }
    if raw.len() != XATTR_KEY_SIZE + name_len {
        return Err(report(context, "size of key doesn't match the name length"));
    }

    Ok(Key {
        id,
        kind,
        number: 0,
        name: Some(name.to_string()),
    })
}

/// Normalize and compare two filenames the way the catalog orders them.
pub fn filename_cmp(name1: &str, name2: &str, case_fold: bool) -> Ordering {
    let mut cursor1 = Unicursor::new(name1);
    let mut cursor2 = Unicursor::new(name2);

    loop {
        let uni1 = cursor1.normalize_next(case_fold);
        let uni2 = cursor2.normalize_next(case_fold);

        match uni1.cmp(&uni2) {
            Ordering::Equal if uni1 == 0 => return Ordering::Equal,
            Ordering::Equal => continue,
            other => return other,
        }
    }
}

/// Compare two keys in tree order.
pub fn keycmp(k1: &Key, k2: &Key, case_insensitive: bool) -> Ordering {
    k1.id
        .cmp(&k2.id)
        .then(k1.kind.cmp(&k2.kind))
        .then(k1.number.cmp(&k2.number))
        .then_with(|| match (&k1.name, &k2.name) {
            (Some(n1), Some(n2)) => {
                if k1.kind == J_TYPE_XATTR {
                    // Xattr names are always compared by raw bytes.
                    n1.as_bytes().cmp(n2.as_bytes())
                } else {
                    filename_cmp(n1, n2, case_insensitive)
                }
            }
            // Keys of this type have no name.
            _ => Ordering::Equal,
        })
}

/// The packed length-and-hash field of a dentry key for @name.
///
/// The hash is a CRC-32C over the normalized (and optionally case-folded)
/// code points, each hashed as a 4-byte little-endian word; the running CRC
/// register is carried between updates without the usual final inversion.
pub fn dentry_hash(name: &str, case_fold: bool) -> u32 {
    let mut hash: u32 = 0xFFFFFFFF;
    let mut cursor = Unicursor::new(name);

    loop {
        let utf32 = cursor.normalize_next(case_fold);
        if utf32 == 0 {
            break;
        }
        hash = crc32c_continue(hash, &utf32.to_le_bytes());
    }

    // The on-disk filename length counts the NUL termination.
    let name_len = name.len() as u32 + 1;

    ((hash & HASH_MASK) << 10) | (name_len & NAME_LEN_MASK)
}

/// Advance a raw CRC-32C register over @bytes.
///
/// `crc32c_append` pre- and post-inverts its state; undoing that on both
/// sides leaves the bare register update the dentry hash is defined over.
fn crc32c_continue(seed: u32, bytes: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, bytes)
}
