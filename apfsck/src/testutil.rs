//! Builders for in-memory filesystem images used by the tests.
//!
//! Everything here assembles checksummed 4096-byte blocks from explicit
//! field values, so tests can produce both well-formed trees and precisely
//! corrupted ones.

use std::io;

use crate::btree::{BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID};
use crate::fletcher;
use crate::key::{dentry_hash, OBJ_ID_MASK, OBJ_TYPE_SHIFT};
use crate::object::{
    OBJ_PHYSICAL, OBJ_VIRTUAL, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_FS,
    OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP,
};
use crate::superblock::{APSB_MAGIC, NX_MAGIC};
use crate::CheckContext;

pub(crate) const BLOCK_SIZE: usize = 4096;

pub(crate) fn ctx(xid: u64) -> CheckContext {
    CheckContext {
        block_size: BLOCK_SIZE as u32,
        xid,
        case_insensitive: false,
    }
}

/// Assemble an image from (block number, block) pairs; unlisted blocks are
/// zero-filled.
pub(crate) fn image(blocks: &[(u64, Vec<u8>)]) -> io::Cursor<Vec<u8>> {
    let max = blocks.iter().map(|(nr, _)| *nr).max().unwrap_or(0) as usize;
    let mut data = vec![0u8; (max + 1) * BLOCK_SIZE];
    for (nr, block) in blocks {
        assert_eq!(block.len(), BLOCK_SIZE);
        let start = *nr as usize * BLOCK_SIZE;
        data[start..start + BLOCK_SIZE].copy_from_slice(block);
    }
    io::Cursor::new(data)
}

/// Footer of a root node.
#[derive(Clone, Copy)]
pub(crate) struct BtInfo {
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtInfo {
    fn bytes(&self) -> [u8; 40] {
        let mut raw = [0u8; 40];
        raw[4..8].copy_from_slice(&self.node_size.to_le_bytes());
        raw[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        raw[12..16].copy_from_slice(&self.val_size.to_le_bytes());
        raw[16..20].copy_from_slice(&self.longest_key.to_le_bytes());
        raw[20..24].copy_from_slice(&self.longest_val.to_le_bytes());
        raw[24..32].copy_from_slice(&self.key_count.to_le_bytes());
        raw[32..40].copy_from_slice(&self.node_count.to_le_bytes());
        raw
    }
}

/// A B-tree node block assembled from explicit parts. The key area is
/// written at its natural offset; the value area bytes end where the value
/// area ends (just before the footer on root nodes).
pub(crate) struct RawNode {
    pub oid: u64,
    pub xid: u64,
    pub obj_type: u32,
    pub subtype: u32,
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: (u16, u16),
    pub free_space: (u16, u16),
    pub key_free_list: (u16, u16),
    pub val_free_list: (u16, u16),
    pub toc: Vec<u8>,
    pub key_area: Vec<u8>,
    pub val_area: Vec<u8>,
    pub info: Option<BtInfo>,
}

impl Default for RawNode {
    fn default() -> Self {
        RawNode {
            oid: 0,
            xid: 1,
            obj_type: OBJ_PHYSICAL | OBJECT_TYPE_BTREE,
            subtype: OBJECT_TYPE_OMAP,
            flags: BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
            level: 0,
            nkeys: 0,
            table_space: (0, 0),
            free_space: (0, 0),
            key_free_list: (BTOFF_INVALID, 0),
            val_free_list: (BTOFF_INVALID, 0),
            toc: Vec::new(),
            key_area: Vec::new(),
            val_area: Vec::new(),
            info: None,
        }
    }
}

impl RawNode {
    pub(crate) fn build(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[8..16].copy_from_slice(&self.oid.to_le_bytes());
        block[16..24].copy_from_slice(&self.xid.to_le_bytes());
        block[24..28].copy_from_slice(&self.obj_type.to_le_bytes());
        block[28..32].copy_from_slice(&self.subtype.to_le_bytes());

        block[32..34].copy_from_slice(&self.flags.to_le_bytes());
        block[34..36].copy_from_slice(&self.level.to_le_bytes());
        block[36..40].copy_from_slice(&self.nkeys.to_le_bytes());
        block[40..42].copy_from_slice(&self.table_space.0.to_le_bytes());
        block[42..44].copy_from_slice(&self.table_space.1.to_le_bytes());
        block[44..46].copy_from_slice(&self.free_space.0.to_le_bytes());
        block[46..48].copy_from_slice(&self.free_space.1.to_le_bytes());
        block[48..50].copy_from_slice(&self.key_free_list.0.to_le_bytes());
        block[50..52].copy_from_slice(&self.key_free_list.1.to_le_bytes());
        block[52..54].copy_from_slice(&self.val_free_list.0.to_le_bytes());
        block[54..56].copy_from_slice(&self.val_free_list.1.to_le_bytes());

        let toc_start = 56 + self.table_space.0 as usize;
        block[toc_start..toc_start + self.toc.len()].copy_from_slice(&self.toc);

        let key_start = toc_start + self.table_space.1 as usize;
        block[key_start..key_start + self.key_area.len()].copy_from_slice(&self.key_area);

        let footer = if self.info.is_some() { 40 } else { 0 };
        let val_end = BLOCK_SIZE - footer;
        block[val_end - self.val_area.len()..val_end].copy_from_slice(&self.val_area);

        if let Some(info) = &self.info {
            block[BLOCK_SIZE - 40..].copy_from_slice(&info.bytes());
        }

        fletcher::seal_object(&mut block);
        block
    }
}

pub(crate) fn kvoff(k: u16, v: u16) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&k.to_le_bytes());
    raw.extend_from_slice(&v.to_le_bytes());
    raw
}

pub(crate) fn kvloc(koff: u16, klen: u16, voff: u16, vlen: u16) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&koff.to_le_bytes());
    raw.extend_from_slice(&klen.to_le_bytes());
    raw.extend_from_slice(&voff.to_le_bytes());
    raw.extend_from_slice(&vlen.to_le_bytes());
    raw
}

/// A node whose records pack both arenas exactly: keys from the start of
/// the key area, values backwards from the end of the value area, with
/// empty free lists.
fn packed_node(
    oid: u64,
    xid: u64,
    virtual_obj: bool,
    subtype: u32,
    flags: u16,
    level: u16,
    fixed: bool,
    records: &[(Vec<u8>, Vec<u8>)],
    info: Option<BtInfo>,
) -> RawNode {
    let storage = if virtual_obj { OBJ_VIRTUAL } else { OBJ_PHYSICAL };
    let obj_type = if flags & BTNODE_ROOT != 0 {
        storage | OBJECT_TYPE_BTREE
    } else {
        storage | OBJECT_TYPE_BTREE_NODE
    };

    let total_val: usize = records.iter().map(|(_, v)| v.len()).sum();
    let mut toc = Vec::new();
    let mut key_area = Vec::new();
    let mut val_area = vec![0u8; total_val];
    let mut v_off = 0usize;

    for (key, val) in records {
        let k_off = key_area.len();
        v_off += val.len();
        if fixed {
            toc.extend_from_slice(&kvoff(k_off as u16, v_off as u16));
        } else {
            toc.extend_from_slice(&kvloc(
                k_off as u16,
                key.len() as u16,
                v_off as u16,
                val.len() as u16,
            ));
        }
        key_area.extend_from_slice(key);
        let pos = total_val - v_off;
        val_area[pos..pos + val.len()].copy_from_slice(val);
    }

    let footer = if info.is_some() { 40 } else { 0 };
    let key_start = 56 + toc.len();
    let data_start = BLOCK_SIZE - footer - total_val;
    let free_gap = data_start - key_start - key_area.len();

    RawNode {
        oid,
        xid,
        obj_type,
        subtype,
        flags,
        level,
        nkeys: records.len() as u32,
        table_space: (0, toc.len() as u16),
        free_space: (key_area.len() as u16, free_gap as u16),
        toc,
        key_area,
        val_area,
        info,
        ..RawNode::default()
    }
}

pub(crate) fn fixed_node(
    oid: u64,
    xid: u64,
    subtype: u32,
    flags: u16,
    level: u16,
    records: &[(Vec<u8>, Vec<u8>)],
    info: Option<BtInfo>,
) -> RawNode {
    packed_node(oid, xid, false, subtype, flags, level, true, records, info)
}

pub(crate) fn var_node(
    oid: u64,
    xid: u64,
    virtual_obj: bool,
    subtype: u32,
    flags: u16,
    level: u16,
    records: &[(Vec<u8>, Vec<u8>)],
    info: Option<BtInfo>,
) -> RawNode {
    packed_node(oid, xid, virtual_obj, subtype, flags, level, false, records, info)
}

/// The object map structure pointing at its B-tree root.
pub(crate) fn omap_phys_block(oid: u64, xid: u64, tree_oid: u64) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[8..16].copy_from_slice(&oid.to_le_bytes());
    block[16..24].copy_from_slice(&xid.to_le_bytes());
    block[24..28].copy_from_slice(&(OBJ_PHYSICAL | OBJECT_TYPE_OMAP).to_le_bytes());
    // om_flags, om_snap_count, om_tree_type, om_snapshot_tree_type
    block[48..56].copy_from_slice(&tree_oid.to_le_bytes());
    fletcher::seal_object(&mut block);
    block
}

// ── Raw keys and values ──────────────────────────────────────────────────

pub(crate) fn omap_key_bytes(oid: u64, xid: u64) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&oid.to_le_bytes());
    raw.extend_from_slice(&xid.to_le_bytes());
    raw
}

pub(crate) fn omap_val_bytes(flags: u32, size: u32, paddr: u64) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&flags.to_le_bytes());
    raw.extend_from_slice(&size.to_le_bytes());
    raw.extend_from_slice(&paddr.to_le_bytes());
    raw
}

pub(crate) fn cat_key_header(id: u64, kind: u8) -> Vec<u8> {
    ((id & OBJ_ID_MASK) | ((kind as u64) << OBJ_TYPE_SHIFT))
        .to_le_bytes()
        .to_vec()
}

pub(crate) fn drec_key_bytes(id: u64, name: &str, case_insensitive: bool) -> Vec<u8> {
    let mut raw = cat_key_header(id, crate::catalog::J_TYPE_DIR_REC);
    raw.extend_from_slice(&dentry_hash(name, case_insensitive).to_le_bytes());
    raw.extend_from_slice(name.as_bytes());
    raw.push(0);
    raw
}

pub(crate) fn drec_val_bytes(file_id: u64, dt: u16) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&file_id.to_le_bytes());
    raw.extend_from_slice(&0i64.to_le_bytes()); // date_added
    raw.extend_from_slice(&dt.to_le_bytes());
    raw
}

pub(crate) fn inode_val_bytes(parent_id: u64, private_id: u64, mode: u16) -> Vec<u8> {
    let mut raw = vec![0u8; 92];
    raw[0..8].copy_from_slice(&parent_id.to_le_bytes());
    raw[8..16].copy_from_slice(&private_id.to_le_bytes());
    raw[80..82].copy_from_slice(&mode.to_le_bytes());
    raw
}

pub(crate) fn file_extent_key_bytes(id: u64, logical_addr: u64) -> Vec<u8> {
    let mut raw = cat_key_header(id, crate::catalog::J_TYPE_FILE_EXTENT);
    raw.extend_from_slice(&logical_addr.to_le_bytes());
    raw
}

pub(crate) fn file_extent_val_bytes(length: u64, paddr: u64) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&length.to_le_bytes());
    raw.extend_from_slice(&paddr.to_le_bytes());
    raw.extend_from_slice(&0u64.to_le_bytes()); // crypto_id
    raw
}

pub(crate) fn phys_ext_key_bytes(paddr: u64) -> Vec<u8> {
    cat_key_header(paddr, crate::catalog::J_TYPE_EXTENT)
}

pub(crate) fn phys_ext_val_bytes(blocks: u64, owner: u64, refcnt: u32) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&(blocks | (1u64 << 60)).to_le_bytes());
    raw.extend_from_slice(&owner.to_le_bytes());
    raw.extend_from_slice(&refcnt.to_le_bytes());
    raw
}

// ── Superblocks ──────────────────────────────────────────────────────────

pub(crate) struct NxSpec {
    pub xid: u64,
    pub omap_oid: u64,
    pub fs_oids: Vec<u64>,
}

pub(crate) fn nxsb_block(spec: &NxSpec) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[8..16].copy_from_slice(&1u64.to_le_bytes());
    block[16..24].copy_from_slice(&spec.xid.to_le_bytes());
    block[24..28].copy_from_slice(&OBJECT_TYPE_NX_SUPERBLOCK.to_le_bytes());

    block[32..36].copy_from_slice(&NX_MAGIC.to_le_bytes());
    block[36..40].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    block[40..48].copy_from_slice(&1024u64.to_le_bytes());
    block[160..168].copy_from_slice(&spec.omap_oid.to_le_bytes());
    block[180..184].copy_from_slice(&(spec.fs_oids.len() as u32).to_le_bytes());
    for (i, oid) in spec.fs_oids.iter().enumerate() {
        block[184 + i * 8..192 + i * 8].copy_from_slice(&oid.to_le_bytes());
    }

    fletcher::seal_object(&mut block);
    block
}

pub(crate) struct ApsbSpec {
    pub oid: u64,
    pub xid: u64,
    pub incompatible_features: u64,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub name: &'static str,
}

pub(crate) fn apsb_block(spec: &ApsbSpec) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[8..16].copy_from_slice(&spec.oid.to_le_bytes());
    block[16..24].copy_from_slice(&spec.xid.to_le_bytes());
    block[24..28].copy_from_slice(&(OBJ_VIRTUAL | OBJECT_TYPE_FS).to_le_bytes());

    block[32..36].copy_from_slice(&APSB_MAGIC.to_le_bytes());
    block[56..64].copy_from_slice(&spec.incompatible_features.to_le_bytes());
    block[128..136].copy_from_slice(&spec.omap_oid.to_le_bytes());
    block[136..144].copy_from_slice(&spec.root_tree_oid.to_le_bytes());
    block[144..152].copy_from_slice(&spec.extentref_tree_oid.to_le_bytes());
    block[152..160].copy_from_slice(&spec.snap_meta_tree_oid.to_le_bytes());
    block[704..704 + spec.name.len()].copy_from_slice(spec.name.as_bytes());

    fletcher::seal_object(&mut block);
    block
}
