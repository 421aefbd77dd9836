use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::atomic_writer::AtomicCsvWriter;
use crate::runtime::{LanguageLayout, display_path, normalize_pathbuf};
use crate::table::{Delimiter, DelimiterChoice, FIRST_DATA_POSITION, POSITION_COLUMN, Table};

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub parts: usize,
    pub delimiter: DelimiterChoice,
}

impl SplitOptions {
    pub fn for_layout(layout: &LanguageLayout, parts: usize, delimiter: DelimiterChoice) -> Self {
        Self {
            source: layout.table_path.clone(),
            output_dir: layout.split_dir.clone(),
            parts,
            delimiter,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentSummary {
    pub part: usize,
    pub path: String,
    pub first_position: Option<u64>,
    pub last_position: Option<u64>,
    pub data_rows: usize,
    pub leading_placeholders: usize,
    pub trailing_placeholders: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub source: String,
    pub output_dir: String,
    pub delimiter: Delimiter,
    pub total_rows: usize,
    pub added_position_column: bool,
    pub fragments: Vec<FragmentSummary>,
}

pub fn fragment_file_name(base_name: &str, part: usize) -> String {
    format!("{base_name}_part{part}.csv")
}

/// Contiguous row-index ranges, one per part. The first `total % parts`
/// ranges hold one extra row.
pub fn partition(total_rows: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let rows_per_part = total_rows / parts;
    let remainder = total_rows % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0usize;
    for part in 0..parts {
        let size = if part < remainder {
            rows_per_part + 1
        } else {
            rows_per_part
        };
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

pub fn split_table(options: &SplitOptions) -> Result<SplitReport> {
    if options.parts == 0 {
        bail!("split requires at least one part");
    }
    if !options.source.exists() {
        bail!(
            "source table not found: {}\nNothing was written to {}",
            display_path(&options.source),
            display_path(&options.output_dir)
        );
    }
    if normalize_pathbuf(&options.source).starts_with(normalize_pathbuf(&options.output_dir)) {
        bail!(
            "output directory {} contains the source table {}; refusing to clear it",
            display_path(&options.output_dir),
            display_path(&options.source)
        );
    }
    let base_name = options
        .source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "cannot derive fragment names from {}",
                display_path(&options.source)
            )
        })?
        .to_string();

    let mut table = Table::read(&options.source, options.delimiter)?;
    let added_position_column = tag_positions(&mut table);
    let tag_index = table
        .column_index(POSITION_COLUMN)
        .ok_or_else(|| anyhow::anyhow!("{POSITION_COLUMN} column missing after tagging"))?;

    reset_output_dir(&options.output_dir)?;
    let fragments = write_fragments(&table, tag_index, &base_name, options)?;
    let total_rows = table.rows.len();

    Ok(SplitReport {
        source: display_path(&options.source),
        output_dir: display_path(&options.output_dir),
        delimiter: table.delimiter,
        total_rows,
        added_position_column,
        fragments,
    })
}

/// Writes every fragment in part order and stops at the first failure. Parts
/// written before the failure stay on disk, each one complete.
fn write_fragments(
    table: &Table,
    tag_index: usize,
    base_name: &str,
    options: &SplitOptions,
) -> Result<Vec<FragmentSummary>> {
    let total_rows = table.rows.len();
    let mut placeholder = vec![String::new(); table.headers.len()];
    let mut fragments = Vec::with_capacity(options.parts);

    for (offset, range) in partition(total_rows, options.parts).into_iter().enumerate() {
        let part = offset + 1;
        let path = options.output_dir.join(fragment_file_name(base_name, part));
        write_fragment(&path, table, &range, tag_index, &mut placeholder)
            .with_context(|| format!("split stopped at part {part} of {}", options.parts))?;

        let (first_position, last_position) = if range.is_empty() {
            (None, None)
        } else {
            (
                Some(position_of(range.start)),
                Some(position_of(range.end - 1)),
            )
        };
        fragments.push(FragmentSummary {
            part,
            path: display_path(&path),
            first_position,
            last_position,
            data_rows: range.len(),
            leading_placeholders: range.start,
            trailing_placeholders: total_rows - range.end,
        });
    }
    Ok(fragments)
}

/// Writes the position of every row into the tag column, appending the column
/// when absent. Returns whether it was appended.
fn tag_positions(table: &mut Table) -> bool {
    let (tag_index, added) = match table.column_index(POSITION_COLUMN) {
        Some(index) => (index, false),
        None => {
            table.headers.push(POSITION_COLUMN.to_string());
            for row in &mut table.rows {
                row.push(String::new());
            }
            (table.headers.len() - 1, true)
        }
    };
    for (index, row) in table.rows.iter_mut().enumerate() {
        row[tag_index] = position_of(index).to_string();
    }
    added
}

fn write_fragment(
    path: &Path,
    table: &Table,
    data_range: &Range<usize>,
    tag_index: usize,
    placeholder: &mut [String],
) -> Result<()> {
    let mut writer = AtomicCsvWriter::new(path, table.delimiter)?;
    writer.write_row(&table.headers)?;
    for (index, row) in table.rows.iter().enumerate() {
        if data_range.contains(&index) {
            writer.write_row(row)?;
        } else {
            placeholder[tag_index] = position_of(index).to_string();
            writer.write_row(&*placeholder)?;
        }
    }
    writer.finish()?;
    Ok(())
}

fn reset_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

fn position_of(index: usize) -> u64 {
    index as u64 + FIRST_DATA_POSITION
}
