use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result, bail};
use regex::{RegexSet, RegexSetBuilder};
use serde::Serialize;
use walkdir::WalkDir;

use crate::runtime::{display_path, normalize_pathbuf, sibling_with_suffix};
use crate::table::{DelimiterChoice, Table};

const IMAGE_EXTENSIONS: [&str; 4] = ["webp", "jpg", "jpeg", "png"];
const IMAGE_PREFIX: &str = "image_";

pub const NO_IMAGES_BACKUP_SUFFIX: &str = "backup_before_remove_no_images";
pub const REMOVE_IDS_BACKUP_SUFFIX: &str = "backup_before_remove_ids";
pub const TRUNCATE_BACKUP_SUFFIX: &str = "backup_before_truncate";

#[derive(Debug, Clone)]
pub struct RemovalOptions {
    pub id_column: String,
    pub backup_suffix: String,
    pub delimiter: DelimiterChoice,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub table_path: String,
    pub table_found: bool,
    pub removed_rows: usize,
    pub removed_ids: Vec<String>,
    pub kept_rows: usize,
    pub backup_path: Option<String>,
    pub backup_created: bool,
    pub rewritten: bool,
}

impl RemovalReport {
    fn not_found(table_path: &Path) -> Self {
        Self {
            table_path: display_path(table_path),
            table_found: false,
            removed_rows: 0,
            removed_ids: Vec::new(),
            kept_rows: 0,
            backup_path: None,
            backup_created: false,
            rewritten: false,
        }
    }
}

pub fn load_id_set(
    list_path: &Path,
    id_column: &str,
    delimiter: DelimiterChoice,
) -> Result<BTreeSet<String>> {
    if !list_path.is_file() {
        bail!("id list not found: {}", display_path(list_path));
    }
    let table = Table::read(list_path, delimiter)?;
    let column = require_column(&table, id_column, list_path)?;
    Ok(table
        .rows
        .iter()
        .map(|row| row[column].trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

/// Removes every row whose id is in `ids`. A table with no matching rows is
/// left untouched.
pub fn remove_products(
    table_path: &Path,
    ids: &BTreeSet<String>,
    options: &RemovalOptions,
) -> Result<RemovalReport> {
    if !table_path.is_file() {
        return Ok(RemovalReport::not_found(table_path));
    }
    let mut table = Table::read(table_path, options.delimiter)?;
    let column = require_column(&table, &options.id_column, table_path)?;

    let mut removed_ids = Vec::new();
    table.rows.retain(|row| {
        let id = row[column].trim();
        if ids.contains(id) {
            removed_ids.push(id.to_string());
            false
        } else {
            true
        }
    });

    finish_removal(table_path, &table, removed_ids, options)
}

pub fn truncate_table(
    table_path: &Path,
    max_rows: usize,
    options: &RemovalOptions,
) -> Result<RemovalReport> {
    if !table_path.is_file() {
        return Ok(RemovalReport::not_found(table_path));
    }
    let mut table = Table::read(table_path, options.delimiter)?;
    if table.rows.len() <= max_rows {
        return finish_removal(table_path, &table, Vec::new(), options);
    }

    // Positional; ids only feed the report.
    let column = table.column_index(&options.id_column);
    let dropped = table.rows.split_off(max_rows);
    let removed_ids = match column {
        Some(column) => dropped
            .iter()
            .map(|row| row[column].trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        None => Vec::new(),
    };
    rewrite_with_backup(table_path, &table, dropped.len(), removed_ids, options)
}

/// Product ids (directory names, sorted) under `images_dir` whose folder holds
/// no `image_*` file with a known image extension.
pub fn find_products_without_images(images_dir: &Path) -> Result<Vec<String>> {
    if !images_dir.is_dir() {
        bail!("images directory not found: {}", display_path(images_dir));
    }

    let mut missing = Vec::new();
    for entry in WalkDir::new(images_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", images_dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if !has_product_image(entry.path())? {
            missing.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(missing)
}

fn has_product_image(product_dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(product_dir)
        .with_context(|| format!("failed to list {}", product_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to list {}", product_dir.display()))?
            .path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if name.starts_with(IMAGE_PREFIX) && IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone)]
pub struct KeywordFilter {
    include: RegexSet,
    exclude: RegexSet,
    columns: Vec<String>,
}

impl KeywordFilter {
    pub fn new(include: &[String], exclude: &[String], columns: &[String]) -> Result<Self> {
        if include.is_empty() {
            bail!("no include patterns; pass --include or set [filter].include in the config");
        }
        if columns.is_empty() {
            bail!("no columns to search; set [filter].columns in the config");
        }
        Ok(Self {
            include: pattern_set(include).context("invalid include pattern")?,
            exclude: pattern_set(exclude).context("invalid exclude pattern")?,
            columns: columns.to_vec(),
        })
    }

    /// Exclusions are checked first.
    pub fn matches(&self, text: &str) -> bool {
        !self.exclude.is_match(text) && self.include.is_match(text)
    }
}

fn pattern_set(patterns: &[String]) -> Result<RegexSet> {
    Ok(RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()?)
}

#[derive(Debug, Clone, Serialize)]
pub struct FindReport {
    pub table_path: String,
    pub table_found: bool,
    pub list_path: String,
    pub searched_columns: Vec<String>,
    pub scanned_rows: usize,
    pub matched_ids: Vec<String>,
    pub written: bool,
}

pub fn find_matching_products(
    table_path: &Path,
    list_path: &Path,
    filter: &KeywordFilter,
    id_column: &str,
    delimiter: DelimiterChoice,
) -> Result<FindReport> {
    let mut report = FindReport {
        table_path: display_path(table_path),
        table_found: table_path.is_file(),
        list_path: display_path(list_path),
        searched_columns: Vec::new(),
        scanned_rows: 0,
        matched_ids: Vec::new(),
        written: false,
    };
    if !report.table_found {
        return Ok(report);
    }
    if normalize_pathbuf(list_path) == normalize_pathbuf(table_path) {
        bail!(
            "id list must differ from the table it is built from: {}",
            display_path(table_path)
        );
    }

    let table = Table::read(table_path, delimiter)?;
    let id_column = require_column(&table, id_column, table_path)?;
    let searched: Vec<usize> = filter
        .columns
        .iter()
        .filter_map(|column| table.column_index(column))
        .collect();
    if searched.is_empty() {
        bail!(
            "none of the columns {} exist in {}\nAvailable columns: {}",
            filter.columns.join(", "),
            display_path(table_path),
            table.headers.join(", ")
        );
    }
    report.searched_columns = searched
        .iter()
        .map(|&index| table.headers[index].clone())
        .collect();

    let mut matched = Vec::new();
    for row in &table.rows {
        let id = row[id_column].trim();
        if id.is_empty() {
            continue;
        }
        report.scanned_rows += 1;
        let text = searched
            .iter()
            .map(|&index| row[index].trim())
            .collect::<Vec<_>>()
            .join(" ");
        if filter.matches(&text) {
            report.matched_ids.push(id.to_string());
            matched.push(row.clone());
        }
    }

    if !matched.is_empty() {
        let list = Table {
            headers: table.headers.clone(),
            rows: matched,
            delimiter: table.delimiter,
        };
        list.write_atomic(list_path)?;
        report.written = true;
    }
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageCleanupReport {
    pub images_dir: String,
    pub removed_dirs: Vec<String>,
    pub rejected_ids: Vec<String>,
}

/// Deletes `images_dir/<id>` for every id. Ids that are not a single plain
/// path component are rejected, never joined.
pub fn remove_image_dirs<'a, I>(images_dir: &Path, ids: I) -> Result<ImageCleanupReport>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut report = ImageCleanupReport {
        images_dir: display_path(images_dir),
        removed_dirs: Vec::new(),
        rejected_ids: Vec::new(),
    };
    for id in ids {
        let mut components = Path::new(id).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain {
            report.rejected_ids.push(id.clone());
            continue;
        }
        let dir = images_dir.join(id);
        if !dir.is_dir() {
            continue;
        }
        fs::remove_dir_all(&dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        report.removed_dirs.push(display_path(&dir));
    }
    Ok(report)
}

fn require_column(table: &Table, column: &str, path: &Path) -> Result<usize> {
    table.column_index(column).ok_or_else(|| {
        anyhow::anyhow!(
            "column {column:?} not found in {}\nAvailable columns: {}",
            display_path(path),
            table.headers.join(", ")
        )
    })
}

fn finish_removal(
    table_path: &Path,
    table: &Table,
    removed_ids: Vec<String>,
    options: &RemovalOptions,
) -> Result<RemovalReport> {
    if removed_ids.is_empty() {
        return Ok(RemovalReport {
            table_path: display_path(table_path),
            table_found: true,
            removed_rows: 0,
            removed_ids,
            kept_rows: table.rows.len(),
            backup_path: None,
            backup_created: false,
            rewritten: false,
        });
    }
    let removed_rows = removed_ids.len();
    rewrite_with_backup(table_path, table, removed_rows, removed_ids, options)
}

fn rewrite_with_backup(
    table_path: &Path,
    table: &Table,
    removed_rows: usize,
    removed_ids: Vec<String>,
    options: &RemovalOptions,
) -> Result<RemovalReport> {
    let backup_path = sibling_with_suffix(table_path, &options.backup_suffix)?;
    let backup_created = if backup_path.exists() {
        false
    } else {
        fs::copy(table_path, &backup_path).with_context(|| {
            format!(
                "failed to back up {} to {}",
                table_path.display(),
                backup_path.display()
            )
        })?;
        true
    };
    table.write_atomic(table_path)?;

    Ok(RemovalReport {
        table_path: display_path(table_path),
        table_found: true,
        removed_rows,
        removed_ids,
        kept_rows: table.rows.len(),
        backup_path: Some(display_path(&backup_path)),
        backup_created,
        rewritten: true,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        KeywordFilter, RemovalOptions, find_matching_products, find_products_without_images,
        load_id_set, remove_image_dirs, remove_products, truncate_table,
    };
    use crate::table::{DelimiterChoice, Table};

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    fn options(suffix: &str) -> RemovalOptions {
        RemovalOptions {
            id_column: "product_id".to_string(),
            backup_suffix: suffix.to_string(),
            delimiter: DelimiterChoice::Auto,
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn remove_products_keeps_order_and_backs_up_once() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        let original = "product_id;title\n1;Lamp\n2;Car seat\n3;Rug\n4;Headlight\n";
        write_file(&table_path, original);

        let report = remove_products(&table_path, &ids(&["2", "4", "99"]), &options("bak"))
            .expect("remove");
        assert!(report.rewritten);
        assert!(report.backup_created);
        assert_eq!(report.removed_ids, vec!["2", "4"]);
        assert_eq!(report.kept_rows, 2);

        let backup_path = temp.path().join("all_products.csv.bak");
        assert_eq!(fs::read_to_string(&backup_path).expect("backup"), original);
        let table = Table::read(&table_path, DelimiterChoice::Auto).expect("read");
        assert_eq!(table.rows, vec![vec!["1", "Lamp"], vec!["3", "Rug"]]);
        let raw = fs::read_to_string(&table_path).expect("raw");
        assert_eq!(raw.lines().next(), Some("product_id;title"));

        let again = remove_products(&table_path, &ids(&["3"]), &options("bak")).expect("again");
        assert!(again.rewritten);
        assert!(!again.backup_created);
        assert_eq!(fs::read_to_string(&backup_path).expect("backup"), original);
    }

    #[test]
    fn remove_products_without_matches_leaves_file_untouched() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        write_file(&table_path, "product_id,title\n1,Lamp\n");

        let report = remove_products(&table_path, &ids(&["7"]), &options("bak")).expect("remove");
        assert!(!report.rewritten);
        assert_eq!(report.kept_rows, 1);
        assert!(!temp.path().join("all_products.csv.bak").exists());
        assert_eq!(
            fs::read_to_string(&table_path).expect("read"),
            "product_id,title\n1,Lamp\n"
        );
    }

    #[test]
    fn missing_id_column_lists_available_columns() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        write_file(&table_path, "sku,title\n1,Lamp\n");

        let err = remove_products(&table_path, &ids(&["1"]), &options("bak")).expect_err("fail");
        let message = err.to_string();
        assert!(message.contains("\"product_id\" not found"));
        assert!(message.contains("sku, title"));
    }

    #[test]
    fn missing_table_is_reported_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let report = remove_products(&temp.path().join("nope.csv"), &ids(&["1"]), &options("bak"))
            .expect("report");
        assert!(!report.table_found);
        assert!(!report.rewritten);
    }

    #[test]
    fn load_id_set_trims_and_skips_blanks() {
        let temp = tempdir().expect("tempdir");
        let list = temp.path().join("products_to_drop.csv");
        write_file(&list, "product_id,title\n 5 ,A\n,B\n6,C\n5,D\n");

        let loaded = load_id_set(&list, "product_id", DelimiterChoice::Auto).expect("load");
        assert_eq!(loaded, ids(&["5", "6"]));
    }

    #[test]
    fn truncate_keeps_leading_rows_and_reports_removed_ids() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        write_file(&table_path, "product_id,title\n1,A\n2,B\n3,C\n4,D\n");

        let report = truncate_table(&table_path, 2, &options("trunc")).expect("truncate");
        assert_eq!(report.removed_ids, vec!["3", "4"]);
        assert_eq!(report.kept_rows, 2);
        let table = Table::read(&table_path, DelimiterChoice::Auto).expect("read");
        assert_eq!(table.rows, vec![vec!["1", "A"], vec!["2", "B"]]);

        let noop = truncate_table(&table_path, 10, &options("trunc")).expect("noop");
        assert!(!noop.rewritten);
        assert!(noop.removed_ids.is_empty());
    }

    #[test]
    fn finds_product_dirs_without_images() {
        let temp = tempdir().expect("tempdir");
        let images = temp.path().join("images").join("products");
        write_file(&images.join("101").join("image_1.webp"), "x");
        write_file(&images.join("102").join("notes.txt"), "x");
        write_file(&images.join("103").join("image_2.JPG"), "x");
        write_file(&images.join("104").join("cover.png"), "x");
        fs::create_dir_all(images.join("105")).expect("empty dir");
        write_file(&images.join("stray.webp"), "x");

        let missing = find_products_without_images(&images).expect("scan");
        assert_eq!(missing, vec!["102", "104", "105"]);
    }

    #[test]
    fn missing_images_dir_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let err = find_products_without_images(&temp.path().join("images")).expect_err("fail");
        assert!(err.to_string().contains("images directory not found"));
    }

    #[test]
    fn truncate_without_id_column_still_truncates() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        write_file(&table_path, "sku,title\n1,A\n2,B\n3,C\n");

        let report = truncate_table(&table_path, 1, &options("trunc")).expect("truncate");
        assert!(report.rewritten);
        assert_eq!(report.removed_rows, 2);
        assert!(report.removed_ids.is_empty());
        let table = Table::read(&table_path, DelimiterChoice::Auto).expect("read");
        assert_eq!(table.rows, vec![vec!["1", "A"]]);
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn keyword_filter_applies_exclusions_first_and_ignores_case() {
        let filter = KeywordFilter::new(
            &strings(&[r"\bheadlight\b", r"\bbmw\b"]),
            &strings(&[r"\bcamper\b"]),
            &strings(&["name"]),
        )
        .expect("filter");
        assert!(filter.matches("LED Headlight for sedans"));
        assert!(filter.matches("seat cover bmw"));
        assert!(!filter.matches("Headlight for camper vans"));
        assert!(!filter.matches("headlights"));
        assert!(!filter.matches("reading lamp"));
    }

    #[test]
    fn keyword_filter_rejects_missing_or_invalid_patterns() {
        let none = KeywordFilter::new(&[], &[], &strings(&["name"])).expect_err("no patterns");
        assert!(none.to_string().contains("no include patterns"));

        let invalid = KeywordFilter::new(&strings(&["(unclosed"]), &[], &strings(&["name"]))
            .expect_err("bad regex");
        assert!(invalid.to_string().contains("invalid include pattern"));
    }

    #[test]
    fn find_writes_matching_rows_to_the_id_list() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("CSV").join("all_products.csv");
        write_file(
            &table_path,
            "product_id;titre;name;price\n\
             1;Phare avant;Front headlight;10\n\
             2;Lampe;Desk lamp;5\n\
             ;Orphan;Headlight;1\n\
             3;Camping;Headlight for camper;7\n\
             4;Amortisseur;Rear damper;30\n",
        );
        let list_path = temp.path().join("CSV").join("products_filtered.csv");
        let filter = KeywordFilter::new(
            &strings(&[r"\bheadlight\b", "amortisseur"]),
            &strings(&[r"\bcamper\b"]),
            &strings(&["titre", "name", "description_short"]),
        )
        .expect("filter");

        let report = find_matching_products(
            &table_path,
            &list_path,
            &filter,
            "product_id",
            DelimiterChoice::Auto,
        )
        .expect("find");
        assert_eq!(report.matched_ids, vec!["1", "4"]);
        assert_eq!(report.scanned_rows, 4);
        assert_eq!(report.searched_columns, vec!["titre", "name"]);
        assert!(report.written);

        let list = Table::read(&list_path, DelimiterChoice::Auto).expect("list");
        assert_eq!(list.headers, vec!["product_id", "titre", "name", "price"]);
        assert_eq!(list.rows.len(), 2);
        assert_eq!(
            load_id_set(&list_path, "product_id", DelimiterChoice::Auto).expect("ids"),
            ids(&["1", "4"])
        );
    }

    #[test]
    fn find_without_matches_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let table_path = temp.path().join("all_products.csv");
        write_file(&table_path, "product_id,name\n1,Lamp\n");
        let list_path = temp.path().join("list.csv");
        let filter =
            KeywordFilter::new(&strings(&["headlight"]), &[], &strings(&["name"])).expect("filter");

        let report = find_matching_products(
            &table_path,
            &list_path,
            &filter,
            "product_id",
            DelimiterChoice::Auto,
        )
        .expect("find");
        assert!(report.matched_ids.is_empty());
        assert!(!report.written);
        assert!(!list_path.exists());
    }

    #[test]
    fn image_dirs_are_removed_for_plain_ids_only() {
        let temp = tempdir().expect("tempdir");
        let images = temp.path().join("images").join("products");
        write_file(&images.join("7").join("image_1.webp"), "x");
        write_file(&images.join("8").join("image_1.webp"), "x");
        write_file(&temp.path().join("images").join("keep.txt"), "x");

        let removal = strings(&["7", "9", "../keep.txt", ".."]);
        let report = remove_image_dirs(&images, &removal).expect("cleanup");
        assert_eq!(report.removed_dirs.len(), 1);
        assert_eq!(report.rejected_ids, vec!["../keep.txt", ".."]);
        assert!(!images.join("7").exists());
        assert!(images.join("8").join("image_1.webp").exists());
        assert!(temp.path().join("images").join("keep.txt").exists());
    }
}
