use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::runtime::{LanguageLayout, display_path, normalize_pathbuf};
use crate::split::fragment_file_name;
use crate::table::{
    Delimiter, DelimiterChoice, FIRST_DATA_POSITION, POSITION_COLUMN, Row, Table, row_has_data,
};

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub input_dir: PathBuf,
    pub base_name: String,
    pub parts: usize,
    pub table_path: PathBuf,
    pub output_path: PathBuf,
    pub backup_path: PathBuf,
    pub delimiter: DelimiterChoice,
}

impl MergeOptions {
    /// Reads parts from the layout's translated dir, named after its table.
    pub fn for_layout(
        layout: &LanguageLayout,
        parts: usize,
        delimiter: DelimiterChoice,
    ) -> Result<Self> {
        Ok(Self {
            input_dir: layout.translated_dir.clone(),
            base_name: layout.base_name()?,
            parts,
            table_path: layout.table_path.clone(),
            output_path: layout.merged_path.clone(),
            backup_path: layout.backup_path.clone(),
            delimiter,
        })
    }

    pub fn fragment_paths(&self) -> Vec<PathBuf> {
        (1..=self.parts)
            .map(|part| self.input_dir.join(fragment_file_name(&self.base_name, part)))
            .collect()
    }

    /// `(part, path)` pairs in the order fragments are applied: sorted by file
    /// name, so `_part10` comes before `_part2`.
    pub fn processing_order(&self) -> Vec<(usize, PathBuf)> {
        let mut ordered: Vec<(usize, PathBuf)> =
            (1..=self.parts).zip(self.fragment_paths()).collect();
        ordered.sort_by(|(_, left), (_, right)| left.file_name().cmp(&right.file_name()));
        ordered
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentReadSummary {
    pub part: usize,
    pub path: String,
    pub delimiter: Delimiter,
    pub body_rows: usize,
    pub data_rows: usize,
    pub placeholder_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub input_dir: String,
    pub output_path: String,
    pub backup_path: String,
    pub table_found: bool,
    pub backup_created: bool,
    pub delimiter: Delimiter,
    pub headers: Vec<String>,
    pub fragments: Vec<FragmentReadSummary>,
    pub merged_rows: usize,
    pub unsortable_rows: usize,
    pub overlaps: Vec<u64>,
    pub warnings: Vec<String>,
}

/// A fragment as read back from disk, labelled for warnings.
#[derive(Debug, Clone)]
pub struct NamedFragment {
    pub name: String,
    pub table: Table,
}

/// Merge outcome before anything is written.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Canonical header with the position column removed.
    pub headers: Vec<String>,
    /// Data rows in ascending position order, then rows with unusable tags.
    pub rows: Vec<Row>,
    pub unsortable_rows: usize,
    pub overlaps: Vec<u64>,
    pub data_rows_per_fragment: Vec<usize>,
    pub warnings: Vec<String>,
}

pub fn merge_fragments(options: &MergeOptions) -> Result<MergeReport> {
    if options.parts == 0 {
        bail!("merge requires at least one part");
    }
    if !options.input_dir.is_dir() {
        bail!(
            "fragment directory not found: {}\n\
             Create it and place the {} translated parts inside ({}).",
            display_path(&options.input_dir),
            options.parts,
            fragment_file_name(&options.base_name, 1)
        );
    }
    if normalize_pathbuf(&options.output_path) == normalize_pathbuf(&options.table_path) {
        bail!(
            "merge output must differ from the source table: {}",
            display_path(&options.table_path)
        );
    }

    let missing: Vec<String> = options
        .fragment_paths()
        .iter()
        .filter(|path| !path.is_file())
        .map(|path| file_name_of(path))
        .collect();
    if !missing.is_empty() {
        let missing_lines = missing
            .iter()
            .map(|name| format!("  - {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(
            "Missing fragment files in {}:\n{missing_lines}\n\
             All {} parts are required; nothing was written.",
            display_path(&options.input_dir),
            options.parts
        );
    }

    let ordered = options.processing_order();
    let mut fragments = Vec::with_capacity(ordered.len());
    for (_, path) in &ordered {
        let table = Table::read(path, options.delimiter)?;
        fragments.push(NamedFragment {
            name: file_name_of(path),
            table,
        });
    }

    let resolution = resolve_fragments(&fragments);
    let delimiter = match options.delimiter {
        DelimiterChoice::Fixed(delimiter) => delimiter,
        DelimiterChoice::Auto => fragments
            .first()
            .map(|fragment| fragment.table.delimiter)
            .unwrap_or(Delimiter::Comma),
    };

    let fragment_summaries = ordered
        .iter()
        .zip(&fragments)
        .zip(&resolution.data_rows_per_fragment)
        .map(|(((part, path), fragment), data_rows)| FragmentReadSummary {
            part: *part,
            path: display_path(path),
            delimiter: fragment.table.delimiter,
            body_rows: fragment.table.rows.len(),
            data_rows: *data_rows,
            placeholder_rows: fragment.table.rows.len() - data_rows,
        })
        .collect();

    let table_found = options.table_path.is_file();
    let backup_created = backup_once(&options.table_path, &options.backup_path)?;

    let merged_rows = resolution.rows.len();
    let merged = Table {
        headers: resolution.headers,
        rows: resolution.rows,
        delimiter,
    };
    merged.write_atomic(&options.output_path)?;

    Ok(MergeReport {
        input_dir: display_path(&options.input_dir),
        output_path: display_path(&options.output_path),
        backup_path: display_path(&options.backup_path),
        table_found,
        backup_created,
        delimiter,
        headers: merged.headers,
        fragments: fragment_summaries,
        merged_rows,
        unsortable_rows: resolution.unsortable_rows,
        overlaps: resolution.overlaps,
        warnings: resolution.warnings,
    })
}

/// Resolves fragments into one row set. Fragments are applied in slice order;
/// when two of them carry data for the same position the later one wins.
pub fn resolve_fragments(fragments: &[NamedFragment]) -> Resolution {
    let Some(first) = fragments.first() else {
        return Resolution::default();
    };
    let canonical = first.table.headers.clone();
    let canonical_tag = canonical.iter().position(|field| field == POSITION_COLUMN);

    let mut by_position: BTreeMap<u64, Row> = BTreeMap::new();
    let mut unsortable: Vec<Row> = Vec::new();
    let mut overlaps = Vec::new();
    let mut data_rows_per_fragment = Vec::with_capacity(fragments.len());
    let mut warnings = Vec::new();

    for fragment in fragments {
        let table = &fragment.table;
        if table.headers != canonical {
            warnings.push(format!(
                "{}: columns differ from {}; values were matched by column name",
                fragment.name, first.name
            ));
        }
        let mapping: Vec<Option<usize>> = canonical
            .iter()
            .map(|field| table.column_index(field))
            .collect();
        let tag_index = table.column_index(POSITION_COLUMN);
        if tag_index.is_none() {
            warnings.push(format!(
                "{}: no {POSITION_COLUMN} column; row order used as position",
                fragment.name
            ));
        }

        let mut data_rows = 0usize;
        for (index, row) in table.rows.iter().enumerate() {
            if !row_has_data(row, tag_index) {
                continue;
            }
            data_rows += 1;

            let aligned: Row = mapping
                .iter()
                .map(|source| {
                    source
                        .and_then(|column| row.get(column))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            let raw_tag = match tag_index {
                Some(column) => row[column].trim().to_string(),
                None => (index as u64 + FIRST_DATA_POSITION).to_string(),
            };

            match parse_position(&raw_tag) {
                Some(position) => {
                    if by_position.insert(position, aligned).is_some() {
                        overlaps.push(position);
                        warnings.push(format!(
                            "position {position}: data in {} replaces data from an earlier part",
                            fragment.name
                        ));
                    }
                }
                None => {
                    warnings.push(format!(
                        "{}: position tag {raw_tag:?} is not numeric; row kept after sorted rows",
                        fragment.name
                    ));
                    unsortable.push(aligned);
                }
            }
        }
        data_rows_per_fragment.push(data_rows);
    }

    let unsortable_rows = unsortable.len();
    let mut rows: Vec<Row> = by_position.into_values().chain(unsortable).collect();
    let mut headers = canonical;
    if let Some(column) = canonical_tag {
        headers.remove(column);
        for row in &mut rows {
            row.remove(column);
        }
    }

    Resolution {
        headers,
        rows,
        unsortable_rows,
        overlaps,
        data_rows_per_fragment,
        warnings,
    }
}

fn parse_position(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Copies `table_path` to `backup_path` unless a backup already exists.
fn backup_once(table_path: &Path, backup_path: &Path) -> Result<bool> {
    if !table_path.is_file() || backup_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create backup dir {}", parent.display()))?;
    }
    fs::copy(table_path, backup_path).with_context(|| {
        format!(
            "failed to back up {} to {}",
            table_path.display(),
            backup_path.display()
        )
    })?;
    Ok(true)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| display_path(path))
}
