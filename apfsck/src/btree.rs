//! B-tree node parsing and whole-tree validation.
//!
//! One generic walker handles all four metadata tree flavors. Every node is
//! checked for internal consistency when it is read: header geometry, object
//! type and subtype, and the free-space linked lists of both record arenas.
//! The walker then enforces tree-wide ordering and per-flavor rules while it
//! visits every record, and reconciles each node's free lists against the
//! space its records actually occupy.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::catalog;
use crate::error::{report, report_unknown, Result};
use crate::extents;
use crate::key::{self, Key};
use crate::object::{self, ObjectHeader};
use crate::CheckContext;

// B-tree node flags (from btn_flags)
pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_MASK: u16 = 0x0007; // valid on-disk flags

/// Sentinel offset ending a free-space list
pub const BTOFF_INVALID: u16 = 0xFFFF;

// Object map flags
pub const OMAP_MANUALLY_MANAGED: u32 = 0x01;
pub const OMAP_ENCRYPTING: u32 = 0x02;
pub const OMAP_DECRYPTING: u32 = 0x04;
pub const OMAP_KEYROLLING: u32 = 0x08;
pub const OMAP_CRYPTO_GENERATION: u32 = 0x10;
pub const OMAP_FLAGS_VALID_MASK: u32 = OMAP_MANUALLY_MANAGED
    | OMAP_ENCRYPTING
    | OMAP_DECRYPTING
    | OMAP_KEYROLLING
    | OMAP_CRYPTO_GENERATION;

const NLOC_SIZE: usize = 4;
const KVLOC_SIZE: usize = 8;
const KVOFF_SIZE: usize = 4;

const OMAP_VAL_SIZE: usize = 16;

fn le16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
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

/// The four B-tree flavors this checker knows how to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Omap,
    Catalog,
    Extentref,
    SnapMeta,
}

impl TreeKind {
    fn context(self) -> &'static str {
        match self {
            TreeKind::Omap => "Object map",
            TreeKind::Catalog => "Catalog",
            TreeKind::Extentref => "Extent reference tree",
            TreeKind::SnapMeta => "Snapshot metadata tree",
        }
    }

    fn expected_subtype(self) -> u32 {
        match self {
            TreeKind::Omap => object::OBJECT_TYPE_OMAP,
            TreeKind::Catalog => object::OBJECT_TYPE_FSTREE,
            TreeKind::Extentref => object::OBJECT_TYPE_BLOCKREFTREE,
            TreeKind::SnapMeta => object::OBJECT_TYPE_SNAPMETATREE,
        }
    }

    /// Physical trees hold their nodes at their block addresses; only the
    /// catalog goes through an object map.
    fn is_physical(self) -> bool {
        !matches!(self, TreeKind::Catalog)
    }
}

/// An (offset, length) pair as stored in node headers and free lists.
#[derive(Debug, Clone, Copy, Default)]
struct Nloc {
    off: u16,
    len: u16,
}

impl Nloc {
    fn parse(raw: &[u8], off: usize) -> Nloc {
        Nloc {
            off: le16(raw, off),
            len: le16(raw, off + 2),
        }
    }
}

/// B-tree node header — 24 bytes after the object header.
#[derive(Debug, Clone)]
struct BTreeNodeHeader {
    btn_flags: u16,
    btn_level: u16,
    btn_nkeys: u32,
    btn_table_space: Nloc,
    btn_free_space: Nloc,
    btn_key_free_list: Nloc,
    btn_val_free_list: Nloc,
}

impl BTreeNodeHeader {
    const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(report("B-tree node", "header is too short"));
        }
        let mut cursor = Cursor::new(data);
        let btn_flags = cursor.read_u16::<LittleEndian>()?;
        let btn_level = cursor.read_u16::<LittleEndian>()?;
        let btn_nkeys = cursor.read_u32::<LittleEndian>()?;
        Ok(BTreeNodeHeader {
            btn_flags,
            btn_level,
            btn_nkeys,
            btn_table_space: Nloc::parse(data, 8),
            btn_free_space: Nloc::parse(data, 12),
            btn_key_free_list: Nloc::parse(data, 16),
            btn_val_free_list: Nloc::parse(data, 20),
        })
    }
}

/// Combined size of the object header and the node header; the table of
/// contents starts here.
pub const NODE_HEADER_SIZE: usize = ObjectHeader::SIZE + BTreeNodeHeader::SIZE;

/// BTreeInfo — 40 bytes at the end of a root node block.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub bt_flags: u32,
    pub bt_node_size: u32,
    pub bt_key_size: u32,
    pub bt_val_size: u32,
    pub bt_longest_key: u32,
    pub bt_longest_val: u32,
    pub bt_key_count: u64,
    pub bt_node_count: u64,
}

impl BTreeInfo {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(report("B-tree", "info footer is too short"));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeInfo {
            bt_flags: cursor.read_u32::<LittleEndian>()?,
            bt_node_size: cursor.read_u32::<LittleEndian>()?,
            bt_key_size: cursor.read_u32::<LittleEndian>()?,
            bt_val_size: cursor.read_u32::<LittleEndian>()?,
            bt_longest_key: cursor.read_u32::<LittleEndian>()?,
            bt_longest_val: cursor.read_u32::<LittleEndian>()?,
            bt_key_count: cursor.read_u64::<LittleEndian>()?,
            bt_node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// One B-tree node, read from disk and validated.
///
/// The four bitmaps track one bit per arena byte: the free bitmaps are built
/// from the in-node free lists when the node is read (a zero bit means the
/// byte is listed as free), the used bitmaps are filled in by the walker as
/// it locates every record.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: TreeKind,
    pub block_nr: u64,
    pub oid: u64,
    pub xid: u64,
    pub flags: u16,
    pub level: u16,
    pub records: u32,

    // Absolute offsets of the node areas within the block
    toc: usize,
    key: usize,
    free: usize,
    data: usize,

    block: Vec<u8>,

    key_free_list: Nloc,
    val_free_list: Nloc,
    free_key_bmap: Vec<u8>,
    free_val_bmap: Vec<u8>,
    used_key_bmap: Vec<u8>,
    used_val_bmap: Vec<u8>,
}

/// Set the bits for a record's bytes, failing on any byte already taken.
fn bmap_mark_as_used(bitmap: &mut [u8], off: usize, len: usize) -> Result<()> {
    for i in off..off + len {
        let byte = &mut bitmap[i / 8];
        let flag = 1 << (i % 8);
        if *byte & flag != 0 {
            return Err(report("B-tree node", "overlapping record data"));
        }
        *byte |= flag;
    }
    Ok(())
}

/// Check one arena's free bitmap against its used bitmap and count the bytes
/// that no record claims (listed free space and unlisted tiny gaps alike).
fn compare_area(free_bmap: &[u8], used_bmap: &[u8], area_len: usize) -> Result<usize> {
    let mut unused = 0;
    for i in 0..area_len {
        let mask = 1u8 << (i % 8);
        let used = used_bmap[i / 8] & mask != 0;
        if !used {
            unused += 1;
        } else if free_bmap[i / 8] & mask == 0 {
            return Err(report("B-tree node", "used record space listed as free"));
        }
    }
    Ok(unused)
}

impl Node {
    /// Read and validate the node with the given object id.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        ctx: &CheckContext,
        oid: u64,
        kind: TreeKind,
        omap_root: Option<&Node>,
    ) -> Result<Node> {
        let (header, block_nr, block) = object::read_object(reader, ctx, oid, omap_root)?;
        let nh = BTreeNodeHeader::parse(&block[ObjectHeader::SIZE..])?;

        let toc = NODE_HEADER_SIZE + nh.btn_table_space.off as usize;
        let key = toc + nh.btn_table_space.len as usize;
        let free = key + nh.btn_free_space.off as usize;
        let data = free + nh.btn_free_space.len as usize;

        let mut node = Node {
            kind,
            block_nr,
            oid: header.oid,
            xid: header.xid,
            flags: nh.btn_flags,
            level: nh.btn_level,
            records: nh.btn_nkeys,
            toc,
            key,
            free,
            data,
            block,
            key_free_list: nh.btn_key_free_list,
            val_free_list: nh.btn_val_free_list,
            free_key_bmap: Vec::new(),
            free_val_bmap: Vec::new(),
            used_key_bmap: Vec::new(),
            used_val_bmap: Vec::new(),
        };

        if !node.is_valid() {
            return Err(report(
                "B-tree node",
                format!("block 0x{:x} is not sane", node.block_nr),
            ));
        }

        let obj_type = header.object_type();
        if node.is_root() && obj_type != object::OBJECT_TYPE_BTREE {
            return Err(report("B-tree node", "wrong object type for root"));
        }
        if !node.is_root() && obj_type != object::OBJECT_TYPE_BTREE_NODE {
            return Err(report("B-tree node", "wrong object type for nonroot"));
        }
        if header.subtype != kind.expected_subtype() {
            return Err(report(kind.context(), "wrong object subtype"));
        }

        node.prepare_bitmaps()?;
        Ok(node)
    }

    /// Basic sanity of the node geometry.
    fn is_valid(&self) -> bool {
        if self.flags & BTNODE_MASK != self.flags {
            return false;
        }
        // Empty children should just be deleted
        if !self.is_root() && self.records == 0 {
            return false;
        }
        // The table of contents follows the header
        if self.toc != NODE_HEADER_SIZE {
            return false;
        }
        // The value area must start before it ends
        if self.data > self.block.len() - self.footer_size() {
            return false;
        }
        // All records must have an entry in the table of contents
        let entry_size = if self.has_fixed_kv() { KVOFF_SIZE } else { KVLOC_SIZE };
        self.records as usize * entry_size <= self.key - self.toc
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn has_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    /// Only the root carries the info footer.
    fn footer_size(&self) -> usize {
        if self.is_root() {
            BTreeInfo::SIZE
        } else {
            0
        }
    }

    fn key_area_len(&self) -> usize {
        self.free - self.key
    }

    fn val_area_len(&self) -> usize {
        self.block.len() - self.data - self.footer_size()
    }

    /// Borrow record bytes located by `locate_key` or `locate_data`.
    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.block[off..off + len]
    }

    /// Locate the key of record @index: absolute offset and length, checked
    /// to lie within the key area.
    pub fn locate_key(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.records as usize {
            return Err(report("B-tree node", "requested index out-of-bounds"));
        }

        let (off_in_area, len) = if self.has_fixed_kv() {
            let entry = self.toc + index * KVOFF_SIZE;
            (le16(&self.block, entry) as usize, key::OMAP_KEY_SIZE)
        } else {
            let entry = self.toc + index * KVLOC_SIZE;
            let k = Nloc::parse(&self.block, entry);
            (k.off as usize, k.len as usize)
        };

        let off = self.key + off_in_area;
        if off + len > self.free {
            return Err(report("B-tree", "key is out-of-bounds"));
        }
        Ok((off, len))
    }

    /// Locate the value of record @index: absolute offset and length, checked
    /// to lie within the value area. Value offsets count backwards from the
    /// end of the area.
    pub fn locate_data(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.records as usize {
            return Err(report("B-tree node", "requested index out-of-bounds"));
        }

        let area_len = self.val_area_len();
        let (v_off, len) = if self.has_fixed_kv() {
            let entry = self.toc + index * KVOFF_SIZE;
            // Node type decides the length
            let len = if self.is_leaf() { OMAP_VAL_SIZE } else { 8 };
            (le16(&self.block, entry + 2) as usize, len)
        } else {
            let entry = self.toc + index * KVLOC_SIZE;
            let v = Nloc::parse(&self.block, entry + NLOC_SIZE);
            (v.off as usize, v.len as usize)
        };

        let off_in_area = match area_len.checked_sub(v_off) {
            Some(off) if v_off > 0 => off,
            _ => return Err(report("B-tree", "value is out-of-bounds")),
        };
        if len > v_off {
            return Err(report("B-tree", "value is out-of-bounds"));
        }
        Ok((self.data + off_in_area, len))
    }

    fn mark_key_used(&mut self, off: usize, len: usize) -> Result<()> {
        bmap_mark_as_used(&mut self.used_key_bmap, off - self.key, len)
    }

    fn mark_val_used(&mut self, off: usize, len: usize) -> Result<()> {
        bmap_mark_as_used(&mut self.used_val_bmap, off - self.data, len)
    }

    /// Allocate the four allocation bitmaps and fill the free ones from the
    /// node's free-space linked lists.
    fn prepare_bitmaps(&mut self) -> Result<()> {
        self.used_key_bmap = vec![0; (self.key_area_len() + 7) / 8];
        self.used_val_bmap = vec![0; (self.val_area_len() + 7) / 8];
        self.parse_key_free_list()?;
        self.parse_val_free_list()
    }

    /// Walk the key-area free list, toggling each listed byte off in a
    /// bitmap that starts all-ones. A byte toggled twice was listed twice.
    fn parse_key_free_list(&mut self) -> Result<()> {
        let area_len = self.key_area_len();
        let mut bitmap = vec![0xFFu8; (area_len + 7) / 8];

        let mut remaining = self.key_free_list.len as i64;
        let mut off = self.key_free_list.off;

        while remaining > 0 {
            // Tiny free areas may not be in the list
            if off == BTOFF_INVALID {
                break;
            }
            let off_us = off as usize;
            if off_us + NLOC_SIZE > area_len {
                return Err(report(
                    "B-tree node",
                    "no room for free list entry in key area",
                ));
            }

            let entry = Nloc::parse(&self.block, self.key + off_us);
            let len = entry.len as usize;
            if len < NLOC_SIZE {
                return Err(report("B-tree node", "free key is too small"));
            }
            if off_us + len > area_len {
                return Err(report("B-tree node", "free key is out-of-bounds"));
            }

            for i in off_us..off_us + len {
                let byte = &mut bitmap[i / 8];
                let flag = 1 << (i % 8);
                if *byte & flag == 0 {
                    return Err(report(
                        "B-tree node",
                        "byte listed twice in free key list",
                    ));
                }
                *byte ^= flag;
            }

            remaining -= len as i64;
            off = entry.off;
        }

        if off != BTOFF_INVALID {
            return Err(report("B-tree node", "bad last key in free list"));
        }

        self.free_key_bmap = bitmap;
        Ok(())
    }

    /// Mirror of the key walk for the value area, with offsets measured
    /// backwards from the end of the area.
    fn parse_val_free_list(&mut self) -> Result<()> {
        let area_len = self.val_area_len();
        let mut bitmap = vec![0xFFu8; (area_len + 7) / 8];

        let mut remaining = self.val_free_list.len as i64;
        let mut off = self.val_free_list.off;

        while remaining > 0 {
            // Tiny free areas may not be in the list
            if off == BTOFF_INVALID {
                break;
            }
            let off_us = off as usize;
            if off_us < NLOC_SIZE {
                return Err(report(
                    "B-tree node",
                    "no room for free list entry in value area",
                ));
            }
            if off_us > area_len {
                return Err(report("B-tree node", "free value is out-of-bounds"));
            }

            let entry = Nloc::parse(&self.block, self.data + area_len - off_us);
            let len = entry.len as usize;
            if len < NLOC_SIZE {
                return Err(report("B-tree node", "free value is too small"));
            }
            if len > off_us {
                return Err(report("B-tree node", "free value is out-of-bounds"));
            }

            for i in area_len - off_us..area_len - off_us + len {
                let byte = &mut bitmap[i / 8];
                let flag = 1 << (i % 8);
                if *byte & flag == 0 {
                    return Err(report(
                        "B-tree node",
                        "byte listed twice in free value list",
                    ));
                }
                *byte ^= flag;
            }

            remaining -= len as i64;
            off = entry.off;
        }

        if off != BTOFF_INVALID {
            return Err(report("B-tree node", "bad last value in free list"));
        }

        self.free_val_bmap = bitmap;
        Ok(())
    }

    /// Reconcile the free bitmaps against the used bitmaps once every record
    /// has been accounted for, and check the free totals in the list heads.
    fn compare_bmaps(&self) -> Result<()> {
        let unused = compare_area(&self.free_key_bmap, &self.used_key_bmap, self.key_area_len())?;
        if unused != self.key_free_list.len as usize {
            return Err(report("B-tree", "wrong free space total for key area"));
        }

        let unused = compare_area(&self.free_val_bmap, &self.used_val_bmap, self.val_area_len())?;
        if unused != self.val_free_list.len as usize {
            return Err(report("B-tree", "wrong free space total for value area"));
        }
        Ok(())
    }
}

/// Stats accumulated over one tree walk, checked against the root footer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: usize,
    pub longest_val: usize,
}

/// A fully walked and checked B-tree. The root stays pinned for footer
/// access and later keyed lookups.
#[derive(Debug)]
pub struct Btree {
    pub kind: TreeKind,
    pub root: Node,
    pub stats: TreeStats,
}

/// Walk the subtree under @node depth-first, checking every record.
///
/// @last_key carries the greatest key seen so far across the whole tree; on
/// return it holds the last key of this subtree so the caller can keep
/// enforcing order across sibling boundaries.
fn parse_subtree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    stats: &mut TreeStats,
    node: &mut Node,
    last_key: &mut Key,
    omap_root: Option<&Node>,
) -> Result<()> {
    if node.is_leaf() {
        if node.level != 0 {
            return Err(report("B-tree", "nonleaf node flagged as leaf"));
        }
        stats.key_count += node.records as u64;
    } else if node.level == 0 {
        return Err(report("B-tree", "node at level zero is not a leaf"));
    }
    stats.node_count += 1;

    match node.kind {
        TreeKind::Omap => {
            if !node.has_fixed_kv() {
                return Err(report("Object map", "key size should be fixed"));
            }
        }
        TreeKind::Catalog => {
            if node.has_fixed_kv() {
                return Err(report("Catalog", "key size should not be fixed"));
            }
        }
        TreeKind::Extentref => {
            if node.has_fixed_kv() {
                return Err(report("Extent reference tree", "key size shouldn't be fixed"));
            }
        }
        TreeKind::SnapMeta => {
            if node.has_fixed_kv() {
                return Err(report("Snap meta tree", "key size shouldn't be fixed"));
            }
            if node.records > 0 {
                return Err(report_unknown("Snapshots"));
            }
            if !node.is_leaf() {
                return Err(report("Snap meta tree", "has no root node"));
            }
        }
    }

    for i in 0..node.records as usize {
        let (koff, klen) = node.locate_key(i)?;
        stats.longest_key = stats.longest_key.max(klen);
        node.mark_key_used(koff, klen)?;

        let curr_key = match node.kind {
            TreeKind::Omap => {
                let raw = node.bytes(koff, klen);
                let mut curr = key::read_omap_key(raw)?;
                // When a key is added, the node is updated
                curr.number = key::omap_key_xid(raw);
                if curr.number > node.xid {
                    return Err(report("Object map", "node xid is older than key xid"));
                }
                curr
            }
            TreeKind::Catalog => key::read_cat_key(node.bytes(koff, klen), ctx.case_insensitive)?,
            TreeKind::Extentref => key::read_extentref_key(node.bytes(koff, klen))?,
            TreeKind::SnapMeta => return Err(report_unknown("Snapshots")),
        };

        let cmp = key::keycmp(last_key, &curr_key, ctx.case_insensitive);
        if cmp == std::cmp::Ordering::Greater {
            return Err(report("B-tree", "keys are out of order"));
        }
        if i != 0 && node.is_leaf() && cmp == std::cmp::Ordering::Equal {
            return Err(report("B-tree", "leaf keys are repeated"));
        }
        *last_key = curr_key;

        let (voff, vlen) = node.locate_data(i)?;
        node.mark_val_used(voff, vlen)?;

        if node.is_leaf() {
            stats.longest_val = stats.longest_val.max(vlen);
            match node.kind {
                TreeKind::Catalog => {
                    catalog::parse_cat_record(ctx, &*last_key, node.bytes(voff, vlen))?;
                }
                TreeKind::Extentref => {
                    // Physical extents must not overlap
                    let last_block =
                        extents::parse_phys_ext_record(&*last_key, node.bytes(voff, vlen))?;
                    last_key.id = last_block;
                }
                TreeKind::Omap => {}
                TreeKind::SnapMeta => return Err(report_unknown("Snapshots")),
            }
            continue;
        }

        if vlen != 8 {
            return Err(report("B-tree", "wrong size of nonleaf record value"));
        }
        let child_oid = le64(node.bytes(voff, vlen), 0);
        let mut child = Node::read(reader, ctx, child_oid, node.kind, omap_root)?;

        if child.level != node.level - 1 {
            return Err(report("B-tree", "node levels are corrupted"));
        }
        if child.is_root() {
            return Err(report("B-tree", "nonroot node is flagged as root"));
        }
        // If a physical node changes, the parent must update the bno
        if node.kind.is_physical() && node.xid < child.xid {
            return Err(report(
                "Physical tree",
                "xid of node is older than xid of its child",
            ));
        }

        parse_subtree(reader, ctx, stats, &mut child, last_key, omap_root)?;
    }

    // All records of the node are processed, so it's a good time for this
    node.compare_bmaps()
}

/// Check the root's info footer against the stats collected by the walk.
fn check_btree_footer(ctx: &CheckContext, btree: &Btree) -> Result<()> {
    let root = &btree.root;
    let context = btree.kind.context();

    // Flags are not part of the footer, but this check fits best here
    if !root.is_root() {
        return Err(report(context, "wrong flag in root node"));
    }

    let info_off = root.block.len() - BTreeInfo::SIZE;
    let info = BTreeInfo::parse(&root.block[info_off..])?;

    if info.bt_node_size != ctx.block_size {
        return Err(report(context, "nodes with more than a block are not supported"));
    }
    if info.bt_key_count != btree.stats.key_count {
        return Err(report(context, "wrong key count in info footer"));
    }
    if info.bt_node_count != btree.stats.node_count {
        return Err(report(context, "wrong node count in info footer"));
    }

    if btree.kind == TreeKind::Omap {
        if info.bt_key_size as usize != key::OMAP_KEY_SIZE {
            return Err(report(context, "wrong key size in info footer"));
        }
        if info.bt_val_size as usize != OMAP_VAL_SIZE {
            return Err(report(context, "wrong value size in info footer"));
        }
        if info.bt_longest_key as usize != key::OMAP_KEY_SIZE {
            return Err(report(context, "wrong maximum key size in info footer"));
        }
        if info.bt_longest_val as usize != OMAP_VAL_SIZE {
            return Err(report(context, "wrong maximum value size in info footer"));
        }
        return Ok(());
    }

    // Only the omap reports fixed key/value sizes
    if info.bt_key_size != 0 {
        return Err(report(context, "key size should not be set"));
    }
    if info.bt_val_size != 0 {
        return Err(report(context, "value size should not be set"));
    }

    match btree.kind {
        TreeKind::Catalog => {
            if (info.bt_longest_key as usize) < btree.stats.longest_key {
                return Err(report(context, "wrong maximum key size in info footer"));
            }
            if (info.bt_longest_val as usize) < btree.stats.longest_val {
                return Err(report(context, "wrong maximum value size in info footer"));
            }
        }
        TreeKind::Extentref => {
            // The extentref tree only holds records of one shape, yet its
            // footer reports variable sizes; the maxima still pin them down.
            if info.bt_longest_key as usize != extents::PHYS_EXT_KEY_SIZE {
                return Err(report(context, "wrong maximum key size in info footer"));
            }
            if info.bt_longest_val as usize != extents::PHYS_EXT_VAL_SIZE {
                return Err(report(context, "wrong maximum value size in info footer"));
            }
        }
        TreeKind::SnapMeta => {
            if info.bt_longest_key != 0 || info.bt_longest_val != 0 {
                return Err(report_unknown("Snapshots"));
            }
        }
        TreeKind::Omap => {}
    }
    Ok(())
}

/// Read a tree root, walk the whole tree, and check the footer.
pub(crate) fn parse_tree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
    kind: TreeKind,
    omap_root: Option<&Node>,
) -> Result<Btree> {
    let mut root = Node::read(reader, ctx, oid, kind, omap_root)?;
    let mut stats = TreeStats::default();
    let mut last_key = Key::default();

    parse_subtree(reader, ctx, &mut stats, &mut root, &mut last_key, omap_root)?;

    let btree = Btree { kind, root, stats };
    check_btree_footer(ctx, &btree)?;
    Ok(btree)
}

/// Parse and check an object map, returning its fully walked B-tree.
///
/// @oid is the physical address of the omap structure itself; the B-tree
/// root address lives inside it.
pub fn parse_omap_btree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
) -> Result<Btree> {
    let (header, _block_nr, block) = object::read_object(reader, ctx, oid, None)?;
    if header.object_type() != object::OBJECT_TYPE_OMAP {
        return Err(report("Object map", "wrong object type"));
    }
    if header.subtype != object::OBJECT_TYPE_INVALID {
        return Err(report("Object map", "wrong object subtype"));
    }

    let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
    let om_flags = cursor.read_u32::<LittleEndian>()?;
    if om_flags & !OMAP_FLAGS_VALID_MASK != 0 {
        return Err(report("Object map", "invalid flags"));
    }
    let om_snap_count = cursor.read_u32::<LittleEndian>()?;
    if om_snap_count != 0 {
        return Err(report_unknown("Snapshots"));
    }
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snapshot_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    parse_tree(reader, ctx, om_tree_oid, TreeKind::Omap, None)
}

/// Parse and check a catalog tree. Catalog nodes are virtual objects, so the
/// volume's object map root must already be checked and pinned.
pub fn parse_cat_btree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
    omap_root: &Node,
) -> Result<Btree> {
    parse_tree(reader, ctx, oid, TreeKind::Catalog, Some(omap_root))
}

/// Parse and check an extent reference tree.
pub fn parse_extentref_btree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
) -> Result<Btree> {
    parse_tree(reader, ctx, oid, TreeKind::Extentref, None)
}

/// Parse and check a snapshot metadata tree, which must be empty.
pub fn parse_snap_meta_btree<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    oid: u64,
) -> Result<Btree> {
    parse_tree(reader, ctx, oid, TreeKind::SnapMeta, None)
}
