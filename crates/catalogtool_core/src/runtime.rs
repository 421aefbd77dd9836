use std::env;
use std::fmt;
use std::fs;
use std::path::{Component, MAIN_SEPARATOR_STR, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::config::{Settings, render_default_config};

pub const STATE_DIR_NAME: &str = ".catalogtool";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const MERGE_BACKUP_SUFFIX: &str = "backup_before_merge";

pub const PROJECT_ROOT_ENV: &str = "CATALOGTOOL_PROJECT_ROOT";
pub const CONFIG_ENV: &str = "CATALOGTOOL_CONFIG";

const TABLE_DIR_MARKER: &str = "CSV";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Flag,
    Env,
    Ancestor,
    WorkingDir,
    Default,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Flag => "--flag",
            Self::Env => "env",
            Self::Ancestor => "found CSV/ above cwd",
            Self::WorkingDir => "cwd",
            Self::Default => "default",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_origin: Origin,
    pub config_origin: Origin,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        [
            format!(
                "project_root: {} [{}]",
                display_path(&self.project_root),
                self.root_origin
            ),
            format!("state_dir: {}", display_path(&self.state_dir)),
            format!(
                "config_path: {} [{}]{}",
                display_path(&self.config_path),
                self.config_origin,
                if self.config_path.is_file() { "" } else { " (missing, defaults in use)" }
            ),
        ]
        .join("\n")
    }
}

pub fn resolve_paths(cwd: &Path, overrides: &PathOverrides) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(cwd, overrides, |key| env::var(key).ok())
}

/// Flag beats env beats the `CSV/` ancestor search; cwd is the last resort.
/// A relative config path is taken relative to the project root.
pub fn resolve_paths_with_lookup<F>(
    cwd: &Path,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    if !cwd.is_absolute() {
        bail!("working directory must be absolute: {}", cwd.display());
    }
    let env_path = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    };

    let (project_root, root_origin) = match (&overrides.project_root, env_path(PROJECT_ROOT_ENV)) {
        (Some(path), _) => (absolutize(path, cwd), Origin::Flag),
        (None, Some(path)) => (absolutize(&path, cwd), Origin::Env),
        (None, None) => match find_catalog_root(cwd) {
            Some(root) => (root, Origin::Ancestor),
            None => (cwd.to_path_buf(), Origin::WorkingDir),
        },
    };
    let project_root = normalize_pathbuf(&project_root);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_origin) = match (&overrides.config, env_path(CONFIG_ENV)) {
        (Some(path), _) => (absolutize(path, &project_root), Origin::Flag),
        (None, Some(path)) => (absolutize(&path, &project_root), Origin::Env),
        (None, None) => (state_dir.join(CONFIG_FILENAME), Origin::Default),
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        root_origin,
        config_origin,
    })
}

pub fn find_catalog_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(TABLE_DIR_MARKER).is_dir())
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub state_dir: String,
    pub state_dir_created: bool,
    pub config_path: String,
    pub wrote_config: bool,
    pub replaced_config: bool,
}

/// Creates the state directory and writes the default config. An existing
/// config is only replaced with `force`.
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let state_dir_created = !paths.state_dir.is_dir();
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;

    let config_exists = paths.config_path.exists();
    let wrote_config = force || !config_exists;
    if wrote_config {
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&paths.config_path, render_default_config())
            .with_context(|| format!("failed to write {}", paths.config_path.display()))?;
    }

    Ok(InitReport {
        state_dir: display_path(&paths.state_dir),
        state_dir_created,
        config_path: display_path(&paths.config_path),
        wrote_config,
        replaced_config: wrote_config && config_exists,
    })
}

/// Per-language file layout. The project root holds the default language;
/// every other language lives in a two-letter sub-directory with the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageLayout {
    pub language: Option<String>,
    pub root: PathBuf,
    pub table_path: PathBuf,
    pub split_dir: PathBuf,
    pub translated_dir: PathBuf,
    pub merged_path: PathBuf,
    pub backup_path: PathBuf,
}

impl LanguageLayout {
    pub fn resolve(
        paths: &ResolvedPaths,
        settings: &Settings,
        language: Option<&str>,
    ) -> Result<Self> {
        let root = match language {
            Some(code) => {
                if !is_language_code(code) {
                    bail!("invalid language directory {code:?}: expected two ASCII letters");
                }
                paths.project_root.join(code)
            }
            None => paths.project_root.clone(),
        };

        let table_path = absolutize(&settings.table, &root);
        let layout = Self {
            language: language.map(str::to_string),
            split_dir: absolutize(&settings.split_dir, &root),
            translated_dir: absolutize(&settings.translated_dir, &root),
            merged_path: PathBuf::new(),
            backup_path: PathBuf::new(),
            table_path: PathBuf::new(),
            root,
        };
        layout.with_table(&table_path)
    }

    /// Same language directories around another table. Relative paths are
    /// taken from the language root; merged output and backup follow the table.
    pub fn with_table(&self, table: &Path) -> Result<Self> {
        let table_path = normalize_pathbuf(&absolutize(table, &self.root));
        let stem = table_stem(&table_path)?;
        let table_dir = table_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        Ok(Self {
            merged_path: table_dir.join(format!("{stem}_translated.csv")),
            backup_path: sibling_with_suffix(&table_path, MERGE_BACKUP_SUFFIX)?,
            table_path,
            ..self.clone()
        })
    }

    pub fn label(&self) -> &str {
        self.language.as_deref().unwrap_or("root")
    }

    pub fn base_name(&self) -> Result<String> {
        table_stem(&self.table_path)
    }
}

pub fn discover_languages(project_root: &Path) -> Result<Vec<String>> {
    if !project_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut languages = Vec::new();
    for entry in fs::read_dir(project_root)
        .with_context(|| format!("failed to list {}", project_root.display()))?
    {
        let entry = entry.with_context(|| format!("failed to list {}", project_root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_language_code(&name) {
            languages.push(name);
        }
    }
    languages.sort();
    Ok(languages)
}

pub fn is_language_code(value: &str) -> bool {
    value.len() == 2 && value.chars().all(|ch| ch.is_ascii_alphabetic())
}

/// `<file>.<suffix>` next to `path`, e.g. `all_products.csv.backup_before_merge`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let mut name = file_name.to_os_string();
    name.push(".");
    name.push(suffix);
    Ok(path.with_file_name(name))
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Lexically resolves `.` and `..` without touching the filesystem.
pub fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut output = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => output.push(prefix.as_os_str()),
            Component::RootDir => output.push(Path::new(MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                output.pop();
            }
            Component::Normal(part) => output.push(part),
        }
    }
    output
}

pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn table_stem(table_path: &Path) -> Result<String> {
    table_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("table path has no file stem: {}", table_path.display()))
}
