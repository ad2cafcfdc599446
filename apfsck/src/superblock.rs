use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{report, CheckError, Result};
use crate::fletcher;
use crate::object::{ObjectHeader, OBJECT_TYPE_NX_SUPERBLOCK};

/// NX_MAGIC = "NXSB" as little-endian u32
pub const NX_MAGIC: u32 = 0x4253584E;

/// APSB_MAGIC = "APSB" as little-endian u32
pub const APSB_MAGIC: u32 = 0x42535041;

/// Maximum number of volume OIDs in a container
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// Volume incompatible-feature flags
pub const APFS_INCOMPAT_CASE_INSENSITIVE: u64 = 0x01;
pub const APFS_INCOMPAT_NORMALIZATION_INSENSITIVE: u64 = 0x08;

const MIN_BLOCK_SIZE: u32 = 4096;
const MAX_BLOCK_SIZE: u32 = 65536;

/// Container superblock (NXSB), reduced to the fields the checker needs.
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub xp_desc_blocks: u32,
    pub xp_desc_base: u64, // physical block of checkpoint descriptor area
    pub omap_oid: u64,     // physical block of the container object map
    pub fs_oids: Vec<u64>, // volume superblock OIDs (virtual)
}

impl NxSuperblock {
    /// Parse the container superblock from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(CheckError::InvalidMagic(magic));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(report("Container superblock", "unsupported block size"));
        }
        let block_count = cursor.read_u64::<LittleEndian>()?;

        // features, readonly-compatible features, incompatible features, uuid
        cursor.seek(SeekFrom::Current(24 + 16))?;
        // next_oid, next_xid
        cursor.seek(SeekFrom::Current(16))?;

        let xp_desc_blocks = cursor.read_u32::<LittleEndian>()?;
        let _xp_data_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_base = cursor.read_u64::<LittleEndian>()?;
        // xp_data_base, the four checkpoint indices and lengths
        cursor.seek(SeekFrom::Current(8 + 16))?;

        let _spaceman_oid = cursor.read_u64::<LittleEndian>()?;
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let _reaper_oid = cursor.read_u64::<LittleEndian>()?;

        let _test_type = cursor.read_u32::<LittleEndian>()?;
        let max_file_systems = cursor.read_u32::<LittleEndian>()? as usize;
        if max_file_systems > NX_MAX_FILE_SYSTEMS {
            return Err(report("Container superblock", "too many volumes"));
        }

        let mut fs_oids = Vec::with_capacity(max_file_systems);
        for _ in 0..max_file_systems {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        Ok(NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            xp_desc_blocks,
            xp_desc_base,
            omap_oid,
            fs_oids,
        })
    }
}

/// Volume superblock (APSB), reduced to the fields the checker needs.
#[derive(Debug, Clone)]
pub struct VolumeSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub incompatible_features: u64,
    pub omap_oid: u64,      // physical block of the volume object map
    pub root_tree_oid: u64, // virtual OID of the catalog B-tree
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_snapshots: u64,
    pub volume_name: String,
}

impl VolumeSuperblock {
    /// Parse a volume superblock from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(CheckError::InvalidMagic(magic));
        }

        let _fs_index = cursor.read_u32::<LittleEndian>()?;
        let _features = cursor.read_u64::<LittleEndian>()?;
        let _readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;

        // unmount_time, reserve/quota/alloc block counts, meta crypto state
        cursor.seek(SeekFrom::Current(8 + 24 + 20))?;

        let _root_tree_type = cursor.read_u32::<LittleEndian>()?;
        let _extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let _snap_meta_tree_type = cursor.read_u32::<LittleEndian>()?;

        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        // revert_to_xid, revert_to_sblock_oid, next_obj_id
        cursor.seek(SeekFrom::Current(24))?;

        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let _num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;

        // total alloced/freed, uuid, last_mod_time, fs_flags,
        // formatted_by, modified_by[8]
        cursor.seek(SeekFrom::Current(16 + 16 + 16 + 48 + 8 * 48))?;

        let mut name_buf = [0u8; 256];
        cursor.read_exact(&mut name_buf)?;
        let nul_pos = name_buf.iter().position(|&b| b == 0).unwrap_or(256);
        let volume_name = String::from_utf8_lossy(&name_buf[..nul_pos]).to_string();

        Ok(VolumeSuperblock {
            header,
            magic,
            incompatible_features,
            omap_oid,
            root_tree_oid,
            extentref_tree_oid,
            snap_meta_tree_oid,
            num_files,
            num_directories,
            num_symlinks,
            num_snapshots,
            volume_name,
        })
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.incompatible_features & APFS_INCOMPAT_CASE_INSENSITIVE != 0
    }
}

/// Read and parse the container superblock from block 0.
pub fn read_nxsb<R: Read + Seek>(reader: &mut R) -> Result<NxSuperblock> {
    reader.seek(SeekFrom::Start(0))?;

    // Read with the minimum block size first to learn the actual one.
    let mut block = vec![0u8; MIN_BLOCK_SIZE as usize];
    reader.read_exact(&mut block)?;

    if !fletcher::verify_object(&block) {
        return Err(CheckError::InvalidChecksum(0));
    }

    let nxsb = NxSuperblock::parse(&block)?;
    if nxsb.block_size == MIN_BLOCK_SIZE {
        return Ok(nxsb);
    }

    reader.seek(SeekFrom::Start(0))?;
    let mut block = vec![0u8; nxsb.block_size as usize];
    reader.read_exact(&mut block)?;

    if !fletcher::verify_object(&block) {
        return Err(CheckError::InvalidChecksum(0));
    }
    NxSuperblock::parse(&block)
}

/// Scan the checkpoint descriptor area for the latest valid NX superblock.
///
/// The area starts at `xp_desc_base` and spans `xp_desc_blocks` blocks. Any
/// block in it that checksums correctly and carries the NX_SUPERBLOCK type is
/// a candidate; the one with the highest transaction id wins. The block-0
/// copy is kept when the scan finds nothing newer.
pub fn find_latest_nxsb<R: Read + Seek>(
    reader: &mut R,
    nxsb: &NxSuperblock,
) -> Result<NxSuperblock> {
    let block_size = nxsb.block_size;
    let mut best: Option<NxSuperblock> = None;

    for i in 0..nxsb.xp_desc_blocks as u64 {
        let block_nr = nxsb.xp_desc_base + i;
        reader.seek(SeekFrom::Start(block_nr * block_size as u64))?;

        let mut block = vec![0u8; block_size as usize];
        if reader.read_exact(&mut block).is_err() {
            continue;
        }
        if !fletcher::verify_object(&block) {
            continue;
        }

        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if header.object_type() != OBJECT_TYPE_NX_SUPERBLOCK {
            continue;
        }

        let candidate = match NxSuperblock::parse(&block) {
            Ok(sb) => sb,
            Err(_) => continue,
        };

        if best.as_ref().map_or(true, |b| candidate.header.xid > b.header.xid) {
            best = Some(candidate);
        }
    }

    match best {
        Some(sb) if sb.header.xid > nxsb.header.xid => Ok(sb),
        _ => Ok(nxsb.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{OBJ_EPHEMERAL, OBJ_VIRTUAL, OBJECT_TYPE_FS};

    fn build_nxsb(xid: u64, omap_oid: u64, fs_oid: u64) -> Vec<u8> {
        let mut block = vec![0u8; 4096];
        block[8..16].copy_from_slice(&1u64.to_le_bytes()); // oid
        block[16..24].copy_from_slice(&xid.to_le_bytes());
        block[24..28]
            .copy_from_slice(&(OBJ_EPHEMERAL | OBJECT_TYPE_NX_SUPERBLOCK).to_le_bytes());

        block[32..36].copy_from_slice(&NX_MAGIC.to_le_bytes());
        block[36..40].copy_from_slice(&4096u32.to_le_bytes());
        block[40..48].copy_from_slice(&1024u64.to_le_bytes()); // block_count
        block[160..168].copy_from_slice(&omap_oid.to_le_bytes());
        block[180..184].copy_from_slice(&1u32.to_le_bytes()); // max_file_systems
        block[184..192].copy_from_slice(&fs_oid.to_le_bytes());

        fletcher::seal_object(&mut block);
        block
    }

    fn build_apsb(incompatible_features: u64, name: &str) -> Vec<u8> {
        let mut block = vec![0u8; 4096];
        block[8..16].copy_from_slice(&0x402u64.to_le_bytes());
        block[16..24].copy_from_slice(&5u64.to_le_bytes());
        block[24..28].copy_from_slice(&(OBJ_VIRTUAL | OBJECT_TYPE_FS).to_le_bytes());

        block[32..36].copy_from_slice(&APSB_MAGIC.to_le_bytes());
        block[56..64].copy_from_slice(&incompatible_features.to_le_bytes());
        block[128..136].copy_from_slice(&0x500u64.to_le_bytes()); // omap_oid
        block[136..144].copy_from_slice(&0x600u64.to_le_bytes()); // root_tree_oid
        block[144..152].copy_from_slice(&0x700u64.to_le_bytes()); // extentref_tree_oid
        block[152..160].copy_from_slice(&0x800u64.to_le_bytes()); // snap_meta_tree_oid
        block[184..192].copy_from_slice(&3u64.to_le_bytes()); // num_files
        block[704..704 + name.len()].copy_from_slice(name.as_bytes());

        fletcher::seal_object(&mut block);
        block
    }

    #[test]
    fn test_parse_nxsb() {
        let block = build_nxsb(9, 0x20, 0x402);
        let nxsb = NxSuperblock::parse(&block).unwrap();
        assert_eq!(nxsb.magic, NX_MAGIC);
        assert_eq!(nxsb.block_size, 4096);
        assert_eq!(nxsb.block_count, 1024);
        assert_eq!(nxsb.omap_oid, 0x20);
        assert_eq!(nxsb.fs_oids, vec![0x402]);
        assert_eq!(nxsb.header.xid, 9);
    }

    #[test]
    fn test_nxsb_invalid_magic() {
        let mut block = build_nxsb(9, 0x20, 0x402);
        block[32..36].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let result = NxSuperblock::parse(&block);
        assert!(matches!(result, Err(CheckError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_nxsb_bad_block_size() {
        let mut block = build_nxsb(9, 0x20, 0x402);
        block[36..40].copy_from_slice(&1000u32.to_le_bytes());
        assert!(NxSuperblock::parse(&block).is_err());
    }

    #[test]
    fn test_parse_apsb() {
        let block = build_apsb(APFS_INCOMPAT_CASE_INSENSITIVE, "Macintosh HD");
        let apsb = VolumeSuperblock::parse(&block).unwrap();
        assert_eq!(apsb.magic, APSB_MAGIC);
        assert!(apsb.is_case_insensitive());
        assert_eq!(apsb.omap_oid, 0x500);
        assert_eq!(apsb.root_tree_oid, 0x600);
        assert_eq!(apsb.extentref_tree_oid, 0x700);
        assert_eq!(apsb.snap_meta_tree_oid, 0x800);
        assert_eq!(apsb.num_files, 3);
        assert_eq!(apsb.volume_name, "Macintosh HD");
    }

    #[test]
    fn test_apsb_case_sensitive_by_default() {
        let block = build_apsb(0, "Data");
        let apsb = VolumeSuperblock::parse(&block).unwrap();
        assert!(!apsb.is_case_insensitive());
    }

    #[test]
    fn test_read_nxsb_from_image() {
        let mut image = vec![0u8; 4096 * 4];
        image[..4096].copy_from_slice(&build_nxsb(3, 0x20, 0x402));
        let mut reader = std::io::Cursor::new(image);

        let nxsb = read_nxsb(&mut reader).unwrap();
        assert_eq!(nxsb.header.xid, 3);
    }

    #[test]
    fn test_find_latest_nxsb() {
        // Block 0 holds xid 3; the descriptor area at block 2 holds xid 5.
        let mut base = build_nxsb(3, 0x20, 0x402);
        base[104..108].copy_from_slice(&2u32.to_le_bytes()); // xp_desc_blocks
        base[112..120].copy_from_slice(&1u64.to_le_bytes()); // xp_desc_base
        fletcher::seal_object(&mut base);

        let mut image = vec![0u8; 4096 * 4];
        image[..4096].copy_from_slice(&base);
        image[4096 * 2..4096 * 3].copy_from_slice(&build_nxsb(5, 0x30, 0x402));
        let mut reader = std::io::Cursor::new(image);

        let nxsb = read_nxsb(&mut reader).unwrap();
        let latest = find_latest_nxsb(&mut reader, &nxsb).unwrap();
        assert_eq!(latest.header.xid, 5);
        assert_eq!(latest.omap_oid, 0x30);
    }
}
