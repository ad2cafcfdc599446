//! apfsck — offline integrity checker for APFS metadata B-trees.
//!
//! Given a read-only image of an APFS container, the checker walks every
//! metadata tree — the container and volume object maps, the catalog, the
//! extent reference tree and the snapshot metadata tree — and verifies node
//! layout, free-space accounting, global key ordering, record schemas and
//! the summary footers. Any violation is fatal: the first inconsistency
//! found is returned as the error.

pub mod btree;
pub mod catalog;
pub mod error;
pub mod extents;
pub mod fletcher;
pub mod key;
pub mod object;
pub mod query;
pub mod superblock;
pub mod unicode;

#[cfg(test)]
pub(crate) mod testutil;

pub use btree::{Btree, Node, TreeKind, TreeStats};
pub use error::{CheckError, Result};

use std::io::{Read, Seek};

use error::{report, report_unknown};

/// Read-only state every check in a scope shares: the container's block
/// size and current transaction id, and the volume's filename sensitivity.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    pub block_size: u32,
    pub xid: u64,
    pub case_insensitive: bool,
}

/// Results for one checked volume.
#[derive(Debug, Clone)]
pub struct VolumeReport {
    pub name: String,
    pub case_insensitive: bool,
    pub omap: TreeStats,
    pub catalog: TreeStats,
    pub extentref: TreeStats,
    pub snap_meta: TreeStats,
}

/// Results for a fully checked container.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub block_size: u32,
    pub xid: u64,
    pub container_omap: TreeStats,
    pub volumes: Vec<VolumeReport>,
}

/// Check a whole container image: superblock, container object map, and
/// every volume in it.
pub fn check_container<R: Read + Seek>(reader: &mut R) -> Result<CheckReport> {
    let nxsb = superblock::read_nxsb(reader)?;
    let nxsb = superblock::find_latest_nxsb(reader, &nxsb)?;

    let ctx = CheckContext {
        block_size: nxsb.block_size,
        xid: nxsb.header.xid,
        case_insensitive: false,
    };

    let container_omap = btree::parse_omap_btree(reader, &ctx, nxsb.omap_oid)?;

    let mut volumes = Vec::new();
    for &fs_oid in nxsb.fs_oids.iter().filter(|&&oid| oid != 0) {
        volumes.push(check_volume(reader, &ctx, &container_omap.root, fs_oid)?);
    }
    if volumes.is_empty() {
        return Err(CheckError::NoVolume);
    }

    Ok(CheckReport {
        block_size: nxsb.block_size,
        xid: nxsb.header.xid,
        container_omap: container_omap.stats,
        volumes,
    })
}

/// Check one volume: its superblock, object map, catalog, extent reference
/// tree and snapshot metadata tree.
pub fn check_volume<R: Read + Seek>(
    reader: &mut R,
    ctx: &CheckContext,
    container_omap_root: &Node,
    fs_oid: u64,
) -> Result<VolumeReport> {
    let (header, _block_nr, block) =
        object::read_object(reader, ctx, fs_oid, Some(container_omap_root))?;
    if header.object_type() != object::OBJECT_TYPE_FS {
        return Err(report("Volume superblock", "wrong object type"));
    }

    let vsb = superblock::VolumeSuperblock::parse(&block)?;
    if vsb.num_snapshots != 0 {
        return Err(report_unknown("Snapshots"));
    }
    if vsb.omap_oid == 0
        || vsb.root_tree_oid == 0
        || vsb.extentref_tree_oid == 0
        || vsb.snap_meta_tree_oid == 0
    {
        return Err(report("Volume superblock", "missing metadata tree"));
    }

    let vol_ctx = CheckContext {
        case_insensitive: vsb.is_case_insensitive(),
        ..*ctx
    };

    let omap = btree::parse_omap_btree(reader, &vol_ctx, vsb.omap_oid)?;
    let catalog = btree::parse_cat_btree(reader, &vol_ctx, vsb.root_tree_oid, &omap.root)?;
    let extentref = btree::parse_extentref_btree(reader, &vol_ctx, vsb.extentref_tree_oid)?;
    let snap_meta = btree::parse_snap_meta_btree(reader, &vol_ctx, vsb.snap_meta_tree_oid)?;

    Ok(VolumeReport {
        name: vsb.volume_name,
        case_insensitive: vol_ctx.case_insensitive,
        omap: omap.stats,
        catalog: catalog.stats,
        extentref: extentref.stats,
        snap_meta: snap_meta.stats,
    })
}
