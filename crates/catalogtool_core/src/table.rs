use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use serde::Serialize;

use crate::atomic_writer::AtomicCsvWriter;

/// Synthetic column carrying a row's position in the source table.
pub const POSITION_COLUMN: &str = "original_row";

/// Spreadsheet line of the first data row (line 1 is the header).
pub const FIRST_DATA_POSITION: u64 = 2;

const UTF8_BOM: char = '\u{feff}';

pub type Row = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Comma,
    Semicolon,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Comma => b',',
            Self::Semicolon => b';',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comma => "comma",
            Self::Semicolon => "semicolon",
        }
    }

    /// `;` wins only when it outnumbers `,` on the header line.
    pub fn detect(first_line: &str) -> Self {
        let semicolons = first_line.matches(';').count();
        let commas = first_line.matches(',').count();
        if semicolons > commas {
            Self::Semicolon
        } else {
            Self::Comma
        }
    }

    pub fn detect_file(path: &Path) -> Result<Self> {
        let text = read_table_text(path)?;
        Ok(Self::detect(first_line(&text)))
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.as_byte() as char)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelimiterChoice {
    #[default]
    Auto,
    Fixed(Delimiter),
}

impl DelimiterChoice {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Some(Self::Auto);
        }
        if value == "," || value.eq_ignore_ascii_case("comma") {
            return Some(Self::Fixed(Delimiter::Comma));
        }
        if value == ";" || value.eq_ignore_ascii_case("semicolon") {
            return Some(Self::Fixed(Delimiter::Semicolon));
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fixed(delimiter) => delimiter.as_str(),
        }
    }

    pub fn resolve(self, text: &str) -> Delimiter {
        match self {
            Self::Auto => Delimiter::detect(first_line(text)),
            Self::Fixed(delimiter) => delimiter,
        }
    }
}

/// A delimited table held fully in memory. Every row is aligned to `headers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
    pub delimiter: Delimiter,
}

impl Table {
    pub fn read(path: &Path, choice: DelimiterChoice) -> Result<Self> {
        let text = read_table_text(path)?;
        Self::parse(&text, choice).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Parses table text. Short rows are padded with empty values and values
    /// past the header width are dropped.
    pub fn parse(text: &str, choice: DelimiterChoice) -> Result<Self> {
        let text = text.strip_prefix(UTF8_BOM).unwrap_or(text);
        let delimiter = choice.resolve(text);
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter.as_byte())
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .context("failed to read header row")?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.iter().all(|field| field.trim().is_empty()) {
            bail!("table has no header row");
        }

        let width = headers.len();
        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!(
                    "failed to read row at line {}",
                    index as u64 + FIRST_DATA_POSITION
                )
            })?;
            let mut row: Row = record.iter().take(width).map(str::to_string).collect();
            row.resize(width, String::new());
            rows.push(row);
        }

        Ok(Self {
            headers,
            rows,
            delimiter,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|field| field == name)
    }

    pub fn write_atomic(&self, path: &Path) -> Result<PathBuf> {
        let mut writer = AtomicCsvWriter::new(path, self.delimiter)?;
        writer.write_row(&self.headers)?;
        for row in &self.rows {
            writer.write_row(row)?;
        }
        writer.finish()
    }
}

/// True when any value outside `skip` holds non-whitespace text.
pub fn row_has_data(row: &[String], skip: Option<usize>) -> bool {
    row.iter()
        .enumerate()
        .any(|(index, value)| Some(index) != skip && !value.trim().is_empty())
}

fn read_table_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
