//! Keyed descent through a B-tree, as an alternative to whole-tree walking.
//!
//! A query remembers where it is inside every node on the path from the root
//! to the current record, so that a multiple-match search can back out of an
//! exhausted subtree and continue in a sibling. Single-match queries reuse
//! one frame and replace the node in place as they descend.

use std::cmp::Ordering;
use std::io::{Read, Seek};

use crate::btree::Node;
use crate::error::{report, Result};
use crate::extents::{PEXT_LEN_MASK, PHYS_EXT_VAL_SIZE};
use crate::key::{self, Key};
use crate::CheckContext;

// Flags for the query structure
pub const QUERY_OMAP: u32 = 0x0001; // this is an object map query
pub const QUERY_CAT: u32 = 0x0002; // this is a catalog tree query
pub const QUERY_EXTENTREF: u32 = 0x0004; // this is an extentref tree query
pub const QUERY_TREE_MASK: u32 = 0x0007; // which b-tree we query
pub const QUERY_MULTIPLE: u32 = 0x0008; // search for multiple matches
pub const QUERY_NEXT: u32 = 0x0010; // find next of multiple matches
pub const QUERY_EXACT: u32 = 0x0020; // search for an exact match
pub const QUERY_DONE: u32 = 0x0040; // the search at this level is over

/// Hard cap on query depth; nothing sane nests deeper.
const MAX_DEPTH: u32 = 12;

const OMAP_VAL_SIZE: usize = 16;

/// One level of a query. The `parent` chain keeps every ancestor node alive
/// (and remembers its index) for as long as the query might backtrack into
/// it; dropping the head query releases the whole chain.
pub struct Query {
    pub node: Node,
    pub key: Key,
    pub flags: u32,
    pub parent: Option<Box<Query>>,

    // Set on success
    pub index: usize,
    pub key_off: usize,
    pub key_len: usize,
    pub off: usize,
    pub len: usize,

    depth: u32,
}

impl Query {
    /// Start a query over @node. Callers set `key` and the flavor flag
    /// themselves; a child query inherits both from its parent.
    pub fn new(node: Node, parent: Option<Box<Query>>) -> Box<Query> {
        let (key, flags, depth) = match &parent {
            Some(p) => (p.key.clone(), p.flags & !(QUERY_DONE | QUERY_NEXT), p.depth + 1),
            None => (Key::default(), 0, 0),
        };
        Box::new(Query {
            // The search starts at the last record and goes backwards
            index: node.records as usize,
            node,
            key,
            flags,
            parent,
            key_off: 0,
            key_len: 0,
            off: 0,
            len: 0,
            depth,
        })
    }

    /// Push a child frame, keeping the current one for backtracking.
    fn push(query: &mut Box<Query>, child: Node) {
        let key = query.key.clone();
        let flags = query.flags & !(QUERY_DONE | QUERY_NEXT);
        let depth = query.depth + 1;
        let child_records = child.records as usize;

        let parent = std::mem::replace(
            query,
            Box::new(Query {
                node: child,
                key,
                flags,
                parent: None,
                index: child_records,
                key_off: 0,
                key_len: 0,
                off: 0,
                len: 0,
                depth,
            }),
        );
        query.parent = Some(parent);
    }
}

enum NodeResult {
    Found,
    NotFound,
    RetryInParent,
}

/// Decode the record key the query currently points at.
fn key_from_query(ctx: &CheckContext, query: &Query) -> Result<Key> {
    let raw = query.node.bytes(query.key_off, query.key_len);

    let mut key = match query.flags & QUERY_TREE_MASK {
        QUERY_CAT => key::read_cat_key(raw, ctx.case_insensitive)?,
        QUERY_OMAP => {
            let mut key = key::read_omap_key(raw)?;
            key.number = key::omap_key_xid(raw);
            key
        }
        QUERY_EXTENTREF => key::read_extentref_key(raw)?,
        _ => return Err(report("B-tree", "bad query flags")),
    };

    if query.flags & QUERY_MULTIPLE != 0 {
        // A multiple query must ignore these fields
        key.number = 0;
        key.name = None;
    }
    Ok(key)
}

/// Find the next matching record in the current node, scanning left.
fn node_next(ctx: &CheckContext, query: &mut Query) -> Result<NodeResult> {
    if query.flags & QUERY_DONE != 0 {
        // Nothing left to search; the query failed
        return Ok(NodeResult::NotFound);
    }

    if query.index == 0 {
        // The next record may be in another node
        return Ok(NodeResult::RetryInParent);
    }
    query.index -= 1;

    let (key_off, key_len) = query.node.locate_key(query.index)?;
    query.key_off = key_off;
    query.key_len = key_len;
    let curr_key = key_from_query(ctx, query)?;

    let cmp = key::keycmp(&curr_key, &query.key, ctx.case_insensitive);
    if cmp == Ordering::Greater {
        return Err(report("B-tree", "records are out of order"));
    }
    if cmp != Ordering::Equal && query.node.is_leaf() && query.flags & QUERY_EXACT != 0 {
        return Ok(NodeResult::NotFound);
    }

    let (off, len) = query.node.locate_data(query.index)?;
    query.off = off;
    query.len = len;
    if len == 0 {
        return Err(report(
            "B-tree",
            format!("corrupted record value in node 0x{:x}", query.node.block_nr),
        ));
    }

    if cmp != Ordering::Equal {
        // This is the last entry that can be relevant in this node. Keep
        // searching the children, but don't return to this level.
        query.flags |= QUERY_DONE;
    }
    Ok(NodeResult::Found)
}

/// Execute a query on a single node: bisect for the last record whose key
/// is not above the sought key.
fn node_query(ctx: &CheckContext, query: &mut Query) -> Result<NodeResult> {
    if query.flags & QUERY_NEXT != 0 {
        return node_next(ctx, query);
    }

    let mut cmp = Ordering::Greater;
    let mut left: i64 = 0;
    let mut right: i64 = 0;

    loop {
        if cmp == Ordering::Greater {
            right = query.index as i64 - 1;
            if right < left {
                return Ok(NodeResult::NotFound);
            }
            query.index = ((left + right) / 2) as usize;
        } else {
            left = query.index as i64;
            query.index = ((left + right + 1) / 2) as usize;
        }

        let (key_off, key_len) = query.node.locate_key(query.index)?;
        query.key_off = key_off;
        query.key_len = key_len;
        let curr_key = key_from_query(ctx, query)?;

        cmp = key::keycmp(&curr_key, &query.key, ctx.case_insensitive);
        if cmp == Ordering::Equal && query.flags & QUERY_MULTIPLE == 0 {
            break;
        }
        if left == right {
            break;
        }
    }

    if cmp == Ordering::Greater {
        return Ok(NodeResult::NotFound);
    }
    if cmp != Ordering::Equal && query.node.is_leaf() && query.flags & QUERY_EXACT != 0 {
        return Ok(NodeResult::NotFound);
    }

    if query.flags & QUERY_MULTIPLE != 0 {
        if cmp != Ordering::Equal {
            // Last relevant entry in this level
            query.flags |= QUERY_DONE;
        }
        query.flags |= QUERY_NEXT;
    }

    let (off, len) = query.node.locate_data(query.index)?;
    query.off = off;
    query.len = len;
    if len == 0 {
        return Err(report(
            "B-tree",
            format!("corrupted record value in node 0x{:x}", query.node.block_nr),
        ));
    }
    Ok(NodeResult::Found)
}

/// Execute a query on a b-tree, descending from `query.node`.
///
/// Returns `true` when a record was found; the query then points at a leaf
/// record through `off`/`len` (and `key_off`/`key_len`). Returns `false`
/// when no matching record exists — the only non-fatal miss in the checker.
/// Calling again on a `QUERY_MULTIPLE` query continues with the next match.
pub fn btree_query<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    omap_root: Option<&Node>,
    query: &mut Box<Query>,
) -> Result<bool> {
    loop {
        if query.depth >= MAX_DEPTH {
            return Err(report("B-tree", "tree is too deep"));
        }

        match node_query(ctx, query)? {
            NodeResult::RetryInParent => {
                match query.parent.take() {
                    // We are at the root of the tree
                    None => return Ok(false),
                    Some(parent) => {
                        // Move back up one level and continue the query
                        *query = parent;
                        continue;
                    }
                }
            }
            NodeResult::NotFound => return Ok(false),
            NodeResult::Found => {}
        }

        if query.node.is_leaf() {
            return Ok(true);
        }

        // Now go a level deeper and search the child
        let child_oid = child_from_query(query)?;
        let child = Node::read(reader, ctx, child_oid, query.node.kind, omap_root)?;

        if query.flags & QUERY_MULTIPLE != 0 {
            // Remember the parent node and index to continue the search later
            Query::push(query, child);
        } else {
            // Reuse the same frame to search the child
            query.node = child;
            query.index = query.node.records as usize;
            query.depth += 1;
        }
    }
}

/// The child object id held by a nonleaf record a query stopped on.
fn child_from_query(query: &Query) -> Result<u64> {
    if query.len != 8 {
        return Err(report("B-tree", "wrong size of nonleaf record value"));
    }
    let raw = query.node.bytes(query.off, query.len);
    Ok(u64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ]))
}

/// Object map record data in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapRecord {
    pub bno: u64,
    pub xid: u64,
}

/// Extent reference record data in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtrefRecord {
    pub phys_addr: u64,
    pub blocks: u64,
    pub owner: u64,
    pub refcnt: u32,
}

/// Read the object map record a successful query points at.
pub fn omap_rec_from_query(query: &Query) -> Result<OmapRecord> {
    if query.len != OMAP_VAL_SIZE {
        return Err(report("Object map record", "wrong size of value"));
    }
    let val = query.node.bytes(query.off, query.len);
    let raw_key = query.node.bytes(query.key_off, query.key_len);

    Ok(OmapRecord {
        bno: u64::from_le_bytes([
            val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15],
        ]),
        xid: key::omap_key_xid(raw_key),
    })
}

/// Read the extent reference record a successful query points at.
pub fn extref_rec_from_query(query: &Query) -> Result<ExtrefRecord> {
    if query.len != PHYS_EXT_VAL_SIZE {
        return Err(report("Extent reference record", "wrong size of value"));
    }
    let val = query.node.bytes(query.off, query.len);
    let raw_key = query.node.bytes(query.key_off, query.key_len);

    // The physical address is used as the id in the extentref tree
    let hdr = u64::from_le_bytes([
        raw_key[0], raw_key[1], raw_key[2], raw_key[3], raw_key[4], raw_key[5], raw_key[6],
        raw_key[7],
    ]);
    let len_and_kind = u64::from_le_bytes([
        val[0], val[1], val[2], val[3], val[4], val[5], val[6], val[7],
    ]);

    Ok(ExtrefRecord {
        phys_addr: hdr & key::OBJ_ID_MASK,
        blocks: len_and_kind & PEXT_LEN_MASK,
        owner: u64::from_le_bytes([
            val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15],
        ]),
        refcnt: u32::from_le_bytes([val[16], val[17], val[18], val[19]]),
    })
}

/// Find the object map record for an object id. The filesystem has already
/// committed to the mapping existing, so a miss is fatal.
pub fn omap_lookup<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    tbl: &Node,
    id: u64,
) -> Result<OmapRecord> {
    let mut query = Query::new(tbl.clone(), None);
    query.key = Key::omap(id, ctx.xid);
    query.flags |= QUERY_OMAP;

    if !btree_query(reader, ctx, None, &mut query)? {
        return Err(report(
            "Object map",
            format!("record missing for id 0x{:x}", id),
        ));
    }
    let rec = omap_rec_from_query(&query)?;
    if rec.bno == 0 {
        return Err(report("Object map", "record maps to block zero"));
    }
    Ok(rec)
}

/// Find the best match for an extent in the extent reference tree.
pub fn extentref_lookup<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    tbl: &Node,
    bno: u64,
) -> Result<ExtrefRecord> {
    let mut query = Query::new(tbl.clone(), None);
    query.key = Key::extentref(bno);
    query.flags |= QUERY_EXTENTREF;

    if !btree_query(reader, ctx, None, &mut query)? {
        return Err(report(
            "Extent reference tree",
            format!("record missing for block number 0x{:x}", bno),
        ));
    }
    extref_rec_from_query(&query)
}
