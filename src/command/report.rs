//! Plain-text rendering of the current configuration (`ShowConf` output).

use std::fmt::Write;

use crate::block_device::Geometry;
use crate::partition::{PartitionIndex, PartitionTable, NAME_LEN, PUBLIC_PARTITION_KEY};
use crate::store::usable_sectors;

use super::parser::UPDATE_CONF_KEYWORD;

pub const REPORT_HEADER: &str = "SD partition configuration";

/// Render `table` with fixed-width columns
///
/// Partition 0 always shows the public sentinel as its key.
#[must_use]
pub fn render(table: &PartitionTable, geometry: &Geometry) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_report(&mut out, table, geometry);
    out
}

fn write_report(out: &mut String, table: &PartitionTable, geometry: &Geometry) -> std::fmt::Result {
    writeln!(out, "{}", REPORT_HEADER)?;
    writeln!(out, "{}", UPDATE_CONF_KEYWORD)?;
    writeln!(out, "{}", table.root_key())?;
    writeln!(out, "{}", table.conf_key())?;
    writeln!(out, "{:<4}{:<w$} {:<w$} {}", "#", "Name", "Key", "SectorCount", w = NAME_LEN)?;

    for (index, partition) in table.iter() {
        let key = if index == PartitionIndex::FIRST {
            PUBLIC_PARTITION_KEY
        } else {
            partition.key.as_str()
        };
        writeln!(
            out,
            "{:<4}{:<w$} {:<w$} {}",
            index.get(),
            partition.name.as_str(),
            key,
            partition.sector_number,
            w = NAME_LEN
        )?;
    }

    writeln!(out, "Capacity: {} sectors", geometry.sector_count)?;
    writeln!(out, "BlockSize: {} bytes", geometry.sector_size)?;
    writeln!(out, "Usable: {} sectors", usable_sectors(geometry.sector_count))?;
    Ok(())
}
