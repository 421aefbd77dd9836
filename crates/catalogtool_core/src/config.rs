use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::table::DelimiterChoice;

pub const DEFAULT_PARTS: usize = 4;
pub const DEFAULT_TABLE: &str = "CSV/all_products.csv";
pub const DEFAULT_SPLIT_DIR: &str = "to_translate";
pub const DEFAULT_TRANSLATED_DIR: &str = "translated";
pub const DEFAULT_ID_COLUMN: &str = "product_id";
pub const DEFAULT_IMAGES_DIR: &str = "images/products";
pub const DEFAULT_FILTER_LIST: &str = "CSV/products_filtered.csv";
pub const DEFAULT_FILTER_COLUMNS: [&str; 3] = ["titre", "name", "description_short"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogConfig {
    #[serde(default)]
    pub translation: TranslationSection,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub filter: FilterSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TranslationSection {
    pub parts: Option<usize>,
    pub delimiter: Option<String>,
    pub table: Option<String>,
    pub split_dir: Option<String>,
    pub translated_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub id_column: Option<String>,
    pub images_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilterSection {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub columns: Option<Vec<String>>,
    pub list: Option<String>,
}

/// Keyword patterns for `catalog find`, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSettings {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub columns: Vec<String>,
    pub list: PathBuf,
}

/// Effective settings after env > config file > built-in defaults.
/// Paths stay relative; callers anchor them at a language root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub parts: usize,
    pub delimiter: DelimiterChoice,
    pub table: PathBuf,
    pub split_dir: PathBuf,
    pub translated_dir: PathBuf,
    pub id_column: String,
    pub images_dir: PathBuf,
    pub filter: FilterSettings,
}

impl CatalogConfig {
    pub fn settings(&self) -> Result<Settings> {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn settings_with_lookup<F>(&self, lookup_env: F) -> Result<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let parts = match env_value("CATALOGTOOL_PARTS") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("CATALOGTOOL_PARTS is not a number: {value:?}"))?,
            None => self.translation.parts.unwrap_or(DEFAULT_PARTS),
        };
        if parts == 0 {
            bail!("translation parts must be at least 1");
        }

        let delimiter_value =
            env_value("CATALOGTOOL_DELIMITER").or_else(|| self.translation.delimiter.clone());
        let delimiter = match delimiter_value {
            Some(value) => DelimiterChoice::parse(&value).ok_or_else(|| {
                anyhow::anyhow!("unknown delimiter {value:?}; expected auto, \",\" or \";\"")
            })?,
            None => DelimiterChoice::Auto,
        };

        let id_column = env_value("CATALOGTOOL_ID_COLUMN")
            .or_else(|| self.catalog.id_column.clone())
            .unwrap_or_else(|| DEFAULT_ID_COLUMN.to_string());

        Ok(Settings {
            parts,
            delimiter,
            table: path_or(&self.translation.table, DEFAULT_TABLE),
            split_dir: path_or(&self.translation.split_dir, DEFAULT_SPLIT_DIR),
            translated_dir: path_or(&self.translation.translated_dir, DEFAULT_TRANSLATED_DIR),
            id_column,
            images_dir: path_or(&self.catalog.images_dir, DEFAULT_IMAGES_DIR),
            filter: FilterSettings {
                include: patterns(&self.filter.include),
                exclude: patterns(&self.filter.exclude),
                columns: match patterns(&self.filter.columns) {
                    columns if columns.is_empty() => {
                        DEFAULT_FILTER_COLUMNS.map(str::to_string).to_vec()
                    }
                    columns => columns,
                },
                list: path_or(&self.filter.list, DEFAULT_FILTER_LIST),
            },
        })
    }
}

/// Load and parse a CatalogConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<CatalogConfig> {
    if !config_path.exists() {
        return Ok(CatalogConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: CatalogConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> String {
    let columns = DEFAULT_FILTER_COLUMNS
        .iter()
        .map(|column| format!("{column:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    [
        "# catalogtool configuration (materialized by `catalogtool init`)".to_string(),
        "# Env overrides: CATALOGTOOL_PARTS, CATALOGTOOL_DELIMITER,".to_string(),
        "#   CATALOGTOOL_ID_COLUMN".to_string(),
        String::new(),
        "[translation]".to_string(),
        format!("parts = {DEFAULT_PARTS}"),
        "# \"auto\" picks ';' when it outnumbers ',' on the header line".to_string(),
        "delimiter = \"auto\"".to_string(),
        format!("table = {DEFAULT_TABLE:?}"),
        format!("split_dir = {DEFAULT_SPLIT_DIR:?}"),
        format!("translated_dir = {DEFAULT_TRANSLATED_DIR:?}"),
        String::new(),
        "[catalog]".to_string(),
        format!("id_column = {DEFAULT_ID_COLUMN:?}"),
        format!("images_dir = {DEFAULT_IMAGES_DIR:?}"),
        String::new(),
        "[filter]".to_string(),
        "# Regexes for `catalog find`; exclude wins over include.".to_string(),
        "# include = ['\\bheadlight\\b', '\\bshock\\s+absorber\\b']".to_string(),
        "# exclude = ['\\bcamper\\b', '\\bmotorhome\\b']".to_string(),
        format!("columns = [{columns}]"),
        format!("list = {DEFAULT_FILTER_LIST:?}"),
        String::new(),
    ]
    .join("\n")
}

/// Trimmed, non-empty entries.
fn patterns(values: &Option<Vec<String>>) -> Vec<String> {
    values
        .iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn path_or(value: &Option<String>, default: &str) -> PathBuf {
    PathBuf::from(
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::table::Delimiter;
    use tempfile::tempdir;

    #[test]
    fn default_settings_match_site_layout() {
        let settings = CatalogConfig::default()
            .settings_with_lookup(|_| None)
            .expect("settings");
        assert_eq!(settings.parts, 4);
        assert_eq!(settings.delimiter, DelimiterChoice::Auto);
        assert_eq!(settings.table, PathBuf::from("CSV/all_products.csv"));
        assert_eq!(settings.split_dir, PathBuf::from("to_translate"));
        assert_eq!(settings.translated_dir, PathBuf::from("translated"));
        assert_eq!(settings.id_column, "product_id");
        assert_eq!(settings.images_dir, PathBuf::from("images/products"));
        assert!(settings.filter.include.is_empty());
        assert_eq!(
            settings.filter.columns,
            vec!["titre", "name", "description_short"]
        );
        assert_eq!(
            settings.filter.list,
            PathBuf::from("CSV/products_filtered.csv")
        );
    }

    #[test]
    fn filter_section_keeps_patterns_verbatim() {
        let config: CatalogConfig = toml::from_str(
            r#"
[filter]
include = ['\bheadlight\b', '  ', 'amortisseur']
exclude = ['\bcamper\b']
columns = ["title"]
list = "CSV/cars.csv"
"#,
        )
        .expect("parse");
        let filter = config.settings_with_lookup(|_| None).expect("settings").filter;
        assert_eq!(filter.include, vec![r"\bheadlight\b", "amortisseur"]);
        assert_eq!(filter.exclude, vec![r"\bcamper\b"]);
        assert_eq!(filter.columns, vec!["title"]);
        assert_eq!(filter.list, PathBuf::from("CSV/cars.csv"));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, CatalogConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[translation]
parts = 6
delimiter = ";"
table = "data/catalog.csv"

[catalog]
id_column = "sku"
"#,
        )
        .expect("write config");

        let settings = load_config(&config_path)
            .expect("load config")
            .settings_with_lookup(|_| None)
            .expect("settings");
        assert_eq!(settings.parts, 6);
        assert_eq!(settings.delimiter, DelimiterChoice::Fixed(Delimiter::Semicolon));
        assert_eq!(settings.table, PathBuf::from("data/catalog.csv"));
        assert_eq!(settings.split_dir, PathBuf::from("to_translate"));
        assert_eq!(settings.id_column, "sku");
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[site]\ndomain = \"example.org\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.translation.parts.is_none());
        assert!(config.catalog.id_column.is_none());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[translation\nparts = 4").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_config_values() {
        let config = CatalogConfig {
            translation: TranslationSection {
                parts: Some(6),
                delimiter: Some(",".to_string()),
                ..TranslationSection::default()
            },
            catalog: CatalogSection {
                id_column: Some("sku".to_string()),
                ..CatalogSection::default()
            },
            ..CatalogConfig::default()
        };
        let env = HashMap::from([
            ("CATALOGTOOL_PARTS".to_string(), " 3 ".to_string()),
            ("CATALOGTOOL_DELIMITER".to_string(), "semicolon".to_string()),
            ("CATALOGTOOL_ID_COLUMN".to_string(), "".to_string()),
        ]);

        let settings = config
            .settings_with_lookup(|key| env.get(key).cloned())
            .expect("settings");
        assert_eq!(settings.parts, 3);
        assert_eq!(settings.delimiter, DelimiterChoice::Fixed(Delimiter::Semicolon));
        assert_eq!(settings.id_column, "sku");
    }

    #[test]
    fn rejects_zero_parts_and_unknown_delimiter() {
        let zero = CatalogConfig {
            translation: TranslationSection {
                parts: Some(0),
                ..TranslationSection::default()
            },
            ..CatalogConfig::default()
        };
        assert!(zero.settings_with_lookup(|_| None).is_err());

        let env = HashMap::from([("CATALOGTOOL_DELIMITER".to_string(), "tab".to_string())]);
        let error = CatalogConfig::default()
            .settings_with_lookup(|key| env.get(key).cloned())
            .expect_err("must fail");
        assert!(error.to_string().contains("unknown delimiter"));
    }

    #[test]
    fn rendered_default_config_round_trips() {
        let config: CatalogConfig = toml::from_str(&render_default_config()).expect("parse");
        let settings = config.settings_with_lookup(|_| None).expect("settings");
        assert_eq!(
            settings,
            CatalogConfig::default()
                .settings_with_lookup(|_| None)
                .expect("defaults")
        );
    }
}
