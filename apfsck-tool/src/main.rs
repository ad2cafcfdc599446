//! apfsck-tool — offline integrity checker for APFS metadata B-trees
//!
//! # Usage
//!
//! ```text
//! apfsck-tool check <image>     Walk and verify every metadata tree
//! ```
//!
//! The checker is read-only and fails fast: the first inconsistency found
//! is reported and the process exits nonzero.

mod style;

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::process;
use std::time::Instant;

use style::*;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "check" => check(&args[2..]),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("{RED}Unknown command: {}{RESET}", args[1]);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}apfsck-tool{RESET} — APFS metadata B-tree checker

{DIM}Walks the object maps, catalog, extent reference and snapshot
metadata trees of a raw APFS container image and verifies node layout,
free-space accounting, key ordering, record schemas and footers.{RESET}

{BOLD}USAGE:{RESET}
    apfsck-tool <COMMAND> [OPTIONS]

{BOLD}COMMANDS:{RESET}
    {GREEN}check{RESET}       <image>        Check every metadata tree in the image

{BOLD}EXAMPLES:{RESET}
    apfsck-tool check container.raw
"#
    );
}

fn check(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: apfsck-tool check <image>");
        process::exit(1);
    }
    let path = &args[0];

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    header(&format!("APFS check: {path}"));
    let started = Instant::now();
    let report = apfsck::check_container(&mut reader)?;

    section("Container");
    kv("Block size", &format!("{} bytes", report.block_size));
    kv("Transaction id", &format!("0x{:x}", report.xid));
    tree_stats("Object map", &report.container_omap);

    for vol in &report.volumes {
        section(&format!("Volume: {}", vol.name));
        kv(
            "Names",
            if vol.case_insensitive {
                "case-insensitive"
            } else {
                "case-sensitive"
            },
        );
        tree_stats("Object map", &vol.omap);
        tree_stats("Catalog", &vol.catalog);
        tree_stats("Extent references", &vol.extentref);
        tree_stats("Snapshot metadata", &vol.snap_meta);
    }

    println!();
    kv_highlight(
        "Result",
        &format!("clean ({})", format_duration(started.elapsed())),
    );
    println!();
    Ok(())
}

fn tree_stats(name: &str, stats: &apfsck::TreeStats) {
    kv(
        name,
        &format!(
            "{} keys in {} nodes (longest key {} B, longest value {} B)",
            format_count(stats.key_count),
            format_count(stats.node_count),
            stats.longest_key,
            stats.longest_val
        ),
    );
}
