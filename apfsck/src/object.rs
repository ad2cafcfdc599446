use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::btree::Node;
use crate::error::{report, CheckError, Result};
use crate::fletcher;
use crate::query;
use crate::CheckContext;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_INVALID: u32 = 0x00;
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_FS: u32 = 0x0D;
pub const OBJECT_TYPE_FSTREE: u32 = 0x0E;
pub const OBJECT_TYPE_BLOCKREFTREE: u32 = 0x0F;
pub const OBJECT_TYPE_SNAPMETATREE: u32 = 0x10;

// Object flag masks (upper 16 bits of type_and_flags)
pub const OBJ_PHYSICAL: u32 = 0x00000000;
pub const OBJ_VIRTUAL: u32 = 0x80000000;
pub const OBJ_EPHEMERAL: u32 = 0x40000000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC0000000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000FFFF;

/// 32-byte header present on every APFS on-disk object. All fields are
/// little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(report(
                "Object",
                format!("header too short: {} bytes", data.len()),
            ));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// The object type (lower 16 bits, no flags).
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    /// The storage type flags (upper 2 bits).
    pub fn storage_type(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }
}

/// Read a full block at the given block number without checksum verification.
pub fn read_block<R: Read + Seek>(
    reader: &mut R,
    block_nr: u64,
    block_size: u32,
) -> Result<Vec<u8>> {
    let mut block = vec![0u8; block_size as usize];
    reader.seek(SeekFrom::Start(block_nr * block_size as u64))?;
    reader.read_exact(&mut block)?;
    Ok(block)
}

/// Read and verify the on-disk object with the given id.
///
/// Physical object ids are block numbers; virtual ids are resolved through
/// the object map rooted at @omap_root. Returns the parsed header, the block
/// number the object was read from, and the raw block.
pub fn read_object<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
    omap_root: Option<&Node>,
) -> Result<(ObjectHeader, u64, Vec<u8>)> {
    let omap_rec = match omap_root {
        Some(root) => Some(query::omap_lookup(reader, ctx, root, oid)?),
        None => None,
    };
    let block_nr = match &omap_rec {
        Some(rec) => rec.bno,
        None => oid,
    };

    let block = read_block(reader, block_nr, ctx.block_size)?;
    if !fletcher::verify_object(&block) {
        return Err(CheckError::InvalidChecksum(block_nr));
    }

    let header = ObjectHeader::parse(&block)?;
    if header.oid != oid {
        return Err(report(
            "Object",
            format!("wrong object id in block 0x{:x}", block_nr),
        ));
    }
    if header.xid == 0 || header.xid > ctx.xid {
        return Err(report(
            "Object",
            format!("bad transaction id in block 0x{:x}", block_nr),
        ));
    }

    match &omap_rec {
        Some(rec) => {
            if header.storage_type() != OBJ_VIRTUAL {
                return Err(report("Object", "mapped object is not virtual"));
            }
            // The mapping is written when the object is, or later.
            if header.xid > rec.xid {
                return Err(report("Object", "object is newer than its omap record"));
            }
        }
        None => {
            if header.storage_type() != OBJ_PHYSICAL {
                return Err(report("Object", "unmapped object is not physical"));
            }
        }
    }

    Ok((header, block_nr, block))
}
