use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use catalogtool_core::catalog::{
    ImageCleanupReport, KeywordFilter, NO_IMAGES_BACKUP_SUFFIX, REMOVE_IDS_BACKUP_SUFFIX,
    RemovalOptions, RemovalReport, TRUNCATE_BACKUP_SUFFIX, find_matching_products,
    find_products_without_images, load_id_set, remove_image_dirs, remove_products,
    truncate_table,
};
use catalogtool_core::config::{Settings, load_config};
use catalogtool_core::merge::{MergeOptions, MergeReport, merge_fragments};
use catalogtool_core::runtime::{
    LanguageLayout, PathOverrides, ResolvedPaths, absolutize, display_path, discover_languages,
    init_layout, resolve_paths,
};
use catalogtool_core::split::{SplitOptions, SplitReport, split_table};
use catalogtool_core::table::{Delimiter, DelimiterChoice};
use clap::{Args, CommandFactory, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "catalogtool",
    version,
    about = "Product catalog maintenance: translation split/merge and table cleanup"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Print the report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write .catalogtool/config.toml with defaults")]
    Init(InitArgs),
    #[command(about = "Split a product table into position-padded parts for translation")]
    Split(SplitArgs),
    #[command(about = "Merge translated parts back into one table")]
    Merge(MergeArgs),
    #[command(name = "detect-delimiter", about = "Print the delimiter detected for a table")]
    DetectDelimiter { path: PathBuf },
    #[command(about = "List language directories under the project root")]
    Languages,
    #[command(about = "Product table cleanup: keyword lists, missing images, removal, truncation")]
    Catalog(CatalogArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SplitArgs {
    #[arg(long, value_name = "CODE", help = "Language directory (e.g. fr); default: project root")]
    lang: Option<String>,
    #[arg(long, value_name = "PATH", help = "Source table (overrides the layout)")]
    source: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Output directory (cleared before writing)")]
    output_dir: Option<PathBuf>,
    #[arg(long, value_name = "N")]
    parts: Option<usize>,
    #[arg(long, value_name = "auto|,|;")]
    delimiter: Option<String>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long, value_name = "CODE", help = "Language directory (e.g. fr); default: project root")]
    lang: Option<String>,
    #[arg(
        long,
        visible_alias = "source",
        value_name = "PATH",
        help = "Table the parts were split from (names the parts, output and backup)"
    )]
    table: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Directory holding the translated parts")]
    input_dir: Option<PathBuf>,
    #[arg(long, value_name = "N")]
    parts: Option<usize>,
    #[arg(long, value_name = "PATH", help = "Merged output path")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "auto|,|;")]
    delimiter: Option<String>,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[command(subcommand)]
    command: CatalogSubcommand,
}

#[derive(Debug, Subcommand)]
enum CatalogSubcommand {
    #[command(about = "Write products whose text matches keyword patterns to an id list")]
    Find(FindArgs),
    #[command(name = "missing-images", about = "List products whose image folder is empty")]
    MissingImages {
        #[arg(long, help = "Also remove those products from the tables")]
        prune: bool,
        #[arg(long, requires = "prune", help = "Delete the product image folders as well")]
        delete_images: bool,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    #[command(about = "Remove products listed in another table")]
    Remove {
        #[arg(long, value_name = "PATH", help = "Table whose id column lists products to remove")]
        ids: PathBuf,
        #[arg(long, help = "Delete the image folders of removed products")]
        delete_images: bool,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    #[command(about = "Keep only the first N products")]
    Truncate {
        #[arg(long, value_name = "N")]
        max_rows: usize,
        #[arg(long, help = "Delete the image folders of removed products")]
        delete_images: bool,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(Debug, Args)]
struct FindArgs {
    #[arg(long, value_name = "REGEX", help = "Pattern that selects a product (repeatable)")]
    include: Vec<String>,
    #[arg(long, value_name = "REGEX", help = "Pattern that vetoes a match (repeatable)")]
    exclude: Vec<String>,
    #[arg(long, value_name = "COLUMNS", value_delimiter = ',', help = "Columns to search")]
    columns: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Id list to write, relative to the language root")]
    output: Option<PathBuf>,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long, value_name = "CODE", conflicts_with = "all_languages")]
    lang: Option<String>,
    #[arg(long, help = "Apply to the root table and every language directory")]
    all_languages: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Split(args)) => run_split(&runtime, args),
        Some(Commands::Merge(args)) => run_merge(&runtime, args),
        Some(Commands::DetectDelimiter { path }) => run_detect_delimiter(&runtime, &path),
        Some(Commands::Languages) => run_languages(&runtime),
        Some(Commands::Catalog(CatalogArgs { command })) => match command {
            CatalogSubcommand::Find(args) => run_catalog_find(&runtime, args),
            CatalogSubcommand::MissingImages {
                prune,
                delete_images,
                scope,
            } => run_catalog_missing_images(&runtime, prune, delete_images, &scope),
            CatalogSubcommand::Remove {
                ids,
                delete_images,
                scope,
            } => run_catalog_remove(&runtime, &ids, delete_images, &scope),
            CatalogSubcommand::Truncate {
                max_rows,
                delete_images,
                scope,
            } => run_catalog_truncate(&runtime, max_rows, delete_images, &scope),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;
    if runtime.json {
        return print_json(&report);
    }

    println!("init");
    println!("project_root: {}", display_path(&paths.project_root));
    println!(
        "state_dir: {} (created={})",
        report.state_dir,
        format_flag(report.state_dir_created)
    );
    println!("config_path: {}", report.config_path);
    if report.replaced_config {
        println!("wrote_config: yes (replaced existing)");
    } else if report.wrote_config {
        println!("wrote_config: yes");
    } else {
        println!("wrote_config: no (exists; use --force to overwrite)");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_split(runtime: &RuntimeOptions, args: SplitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let layout = table_layout(&paths, &settings, args.lang.as_deref(), args.source)?;

    let mut options = SplitOptions::for_layout(
        &layout,
        args.parts.unwrap_or(settings.parts),
        delimiter_choice(args.delimiter.as_deref(), settings.delimiter)?,
    );
    if let Some(output_dir) = args.output_dir {
        options.output_dir = absolutize(&output_dir, &paths.project_root);
    }
    let report = split_table(&options)?;
    if runtime.json {
        return print_json(&report);
    }

    print_split_report(layout.label(), &report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_merge(runtime: &RuntimeOptions, args: MergeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let layout = table_layout(&paths, &settings, args.lang.as_deref(), args.table)?;

    let mut options = MergeOptions::for_layout(
        &layout,
        args.parts.unwrap_or(settings.parts),
        delimiter_choice(args.delimiter.as_deref(), settings.delimiter)?,
    )?;
    if let Some(input_dir) = args.input_dir {
        options.input_dir = absolutize(&input_dir, &paths.project_root);
    }
    if let Some(output) = args.output {
        options.output_path = absolutize(&output, &paths.project_root);
    }
    let report = merge_fragments(&options)?;
    if runtime.json {
        return print_json(&report);
    }

    print_merge_report(layout.label(), &report, &options);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_detect_delimiter(runtime: &RuntimeOptions, path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("table not found: {}", display_path(path));
    }
    let delimiter = Delimiter::detect_file(path)?;
    if runtime.json {
        return print_json(&delimiter);
    }
    println!("path: {}", display_path(path));
    println!("delimiter: {delimiter}");
    Ok(())
}

fn run_languages(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let languages = discover_languages(&paths.project_root)?;
    if runtime.json {
        return print_json(&languages);
    }

    println!("languages");
    println!("project_root: {}", display_path(&paths.project_root));
    println!("languages.count: {}", languages.len());
    if languages.is_empty() {
        println!("languages: <none>");
    } else {
        for language in &languages {
            println!("languages.code: {language}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_find(runtime: &RuntimeOptions, args: FindArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let or_configured = |flag: Vec<String>, configured: &[String]| {
        if flag.is_empty() {
            configured.to_vec()
        } else {
            flag
        }
    };
    let filter = KeywordFilter::new(
        &or_configured(args.include, &settings.filter.include),
        &or_configured(args.exclude, &settings.filter.exclude),
        &or_configured(args.columns, &settings.filter.columns),
    )?;
    let list = args.output.unwrap_or_else(|| settings.filter.list.clone());

    let mut reports = Vec::new();
    for layout in scope_layouts(&paths, &settings, &args.scope)? {
        reports.push(find_matching_products(
            &layout.table_path,
            &absolutize(&list, &layout.root),
            &filter,
            &settings.id_column,
            settings.delimiter,
        )?);
    }
    if runtime.json {
        return print_json(&reports);
    }

    println!("catalog find");
    for report in &reports {
        if !report.table_found {
            println!("table: {} (missing, skipped)", report.table_path);
            continue;
        }
        println!(
            "table: {} scanned={} matched={} columns={}",
            report.table_path,
            report.scanned_rows,
            report.matched_ids.len(),
            report.searched_columns.join(",")
        );
        if report.written {
            println!("  list: {}", report.list_path);
        } else {
            println!("  list: not written (no matches)");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_missing_images(
    runtime: &RuntimeOptions,
    prune: bool,
    delete_images: bool,
    scope: &ScopeArgs,
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let images_dir = absolutize(&settings.images_dir, &paths.project_root);
    let missing = find_products_without_images(&images_dir)?;

    let mut reports = Vec::new();
    if prune && !missing.is_empty() {
        let ids = missing.iter().cloned().collect();
        let options = removal_options(&settings, NO_IMAGES_BACKUP_SUFFIX);
        for layout in scope_layouts(&paths, &settings, scope)? {
            reports.push(remove_products(&layout.table_path, &ids, &options)?);
        }
    }
    let cleanup = if prune && delete_images {
        Some(remove_image_dirs(&images_dir, &missing)?)
    } else {
        None
    };
    if runtime.json {
        return print_json(&serde_json::json!({
            "images_dir": display_path(&images_dir),
            "products_without_images": missing,
            "tables": reports,
            "image_cleanup": cleanup,
        }));
    }

    println!("catalog missing-images");
    println!("images_dir: {}", display_path(&images_dir));
    println!("products_without_images.count: {}", missing.len());
    for id in &missing {
        println!("products_without_images.id: {id}");
    }
    println!("prune: {}", format_flag(prune));
    print_removal_reports(&reports);
    print_image_cleanup(cleanup.as_ref());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_remove(
    runtime: &RuntimeOptions,
    ids_path: &Path,
    delete_images: bool,
    scope: &ScopeArgs,
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let ids_path = absolutize(ids_path, &paths.project_root);
    let ids = load_id_set(&ids_path, &settings.id_column, settings.delimiter)?;

    let options = removal_options(&settings, REMOVE_IDS_BACKUP_SUFFIX);
    let mut reports = Vec::new();
    for layout in scope_layouts(&paths, &settings, scope)? {
        reports.push(remove_products(&layout.table_path, &ids, &options)?);
    }
    let cleanup = cleanup_removed_images(&paths, &settings, &reports, delete_images)?;
    if runtime.json {
        return print_json(&serde_json::json!({ "tables": reports, "image_cleanup": cleanup }));
    }

    println!("catalog remove");
    println!("ids_path: {}", display_path(&ids_path));
    println!("ids.count: {}", ids.len());
    print_removal_reports(&reports);
    print_image_cleanup(cleanup.as_ref());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_truncate(
    runtime: &RuntimeOptions,
    max_rows: usize,
    delete_images: bool,
    scope: &ScopeArgs,
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;

    let options = removal_options(&settings, TRUNCATE_BACKUP_SUFFIX);
    let mut reports = Vec::new();
    for layout in scope_layouts(&paths, &settings, scope)? {
        reports.push(truncate_table(&layout.table_path, max_rows, &options)?);
    }
    let cleanup = cleanup_removed_images(&paths, &settings, &reports, delete_images)?;
    if runtime.json {
        return print_json(&serde_json::json!({ "tables": reports, "image_cleanup": cleanup }));
    }

    println!("catalog truncate");
    println!("max_rows: {max_rows}");
    print_removal_reports(&reports);
    print_image_cleanup(cleanup.as_ref());
    print_diagnostics(runtime, &paths);
    Ok(())
}

/// Image folders are shared by every language, so ids are pooled first.
fn cleanup_removed_images(
    paths: &ResolvedPaths,
    settings: &Settings,
    reports: &[RemovalReport],
    delete_images: bool,
) -> Result<Option<ImageCleanupReport>> {
    if !delete_images {
        return Ok(None);
    }
    let removed: BTreeSet<String> = reports
        .iter()
        .flat_map(|report| report.removed_ids.iter().cloned())
        .collect();
    let images_dir = absolutize(&settings.images_dir, &paths.project_root);
    Ok(Some(remove_image_dirs(&images_dir, &removed)?))
}

fn print_split_report(label: &str, report: &SplitReport) {
    println!("split");
    println!("language: {label}");
    println!("source: {}", report.source);
    println!("output_dir: {}", report.output_dir);
    println!("delimiter: {}", report.delimiter);
    println!("total_rows: {}", report.total_rows);
    println!("added_position_column: {}", report.added_position_column);
    for fragment in &report.fragments {
        let range = match (fragment.first_position, fragment.last_position) {
            (Some(first), Some(last)) => format!("{first}-{last}"),
            _ => "<empty>".to_string(),
        };
        println!(
            "part{}: {} placeholders + {} data rows ({range}) + {} placeholders -> {}",
            fragment.part,
            fragment.leading_placeholders,
            fragment.data_rows,
            fragment.trailing_placeholders,
            fragment.path
        );
    }
}

fn print_merge_report(label: &str, report: &MergeReport, options: &MergeOptions) {
    println!("merge");
    println!("language: {label}");
    println!("input_dir: {}", report.input_dir);
    println!("delimiter: {}", report.delimiter);
    for fragment in &report.fragments {
        println!(
            "part{}: {} data rows, {} placeholders ({})",
            fragment.part, fragment.data_rows, fragment.placeholder_rows, fragment.path
        );
    }
    println!("merged_rows: {}", report.merged_rows);
    println!("unsortable_rows: {}", report.unsortable_rows);
    println!("overlaps: {}", report.overlaps.len());
    println!("output_path: {}", report.output_path);
    if report.backup_created {
        println!("backup: created {}", report.backup_path);
    } else if report.table_found {
        println!("backup: kept existing {}", report.backup_path);
    } else {
        println!("backup: skipped (no table at {})", display_path(&options.table_path));
    }
    print_warnings(&report.warnings);
    println!(
        "promote: cp {} {}",
        report.output_path,
        display_path(&options.table_path)
    );
}

fn print_removal_reports(reports: &[RemovalReport]) {
    for report in reports {
        if !report.table_found {
            println!("table: {} (missing, skipped)", report.table_path);
            continue;
        }
        println!(
            "table: {} removed={} kept={} rewritten={}",
            report.table_path,
            report.removed_rows,
            report.kept_rows,
            format_flag(report.rewritten)
        );
        if let Some(backup_path) = &report.backup_path {
            println!(
                "  backup: {backup_path} ({})",
                if report.backup_created { "created" } else { "kept existing" }
            );
        }
    }
}

fn print_image_cleanup(cleanup: Option<&ImageCleanupReport>) {
    let Some(cleanup) = cleanup else {
        return;
    };
    println!(
        "image_dirs_removed: {} (under {})",
        cleanup.removed_dirs.len(),
        cleanup.images_dir
    );
    for id in &cleanup.rejected_ids {
        println!("  rejected id (not a plain folder name): {id:?}");
    }
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn scope_layouts(
    paths: &ResolvedPaths,
    settings: &Settings,
    scope: &ScopeArgs,
) -> Result<Vec<LanguageLayout>> {
    if !scope.all_languages {
        return Ok(vec![LanguageLayout::resolve(
            paths,
            settings,
            scope.lang.as_deref(),
        )?]);
    }
    let mut layouts = vec![LanguageLayout::resolve(paths, settings, None)?];
    for language in discover_languages(&paths.project_root)? {
        layouts.push(LanguageLayout::resolve(paths, settings, Some(&language))?);
    }
    Ok(layouts)
}

fn removal_options(settings: &Settings, backup_suffix: &str) -> RemovalOptions {
    RemovalOptions {
        id_column: settings.id_column.clone(),
        backup_suffix: backup_suffix.to_string(),
        delimiter: settings.delimiter,
    }
}

fn delimiter_choice(flag: Option<&str>, configured: DelimiterChoice) -> Result<DelimiterChoice> {
    match flag {
        Some(value) => DelimiterChoice::parse(value).ok_or_else(|| {
            anyhow::anyhow!("unknown delimiter {value:?}; expected auto, \",\" or \";\"")
        }),
        None => Ok(configured),
    }
}

/// Language layout, rebased on `table` (relative to the project root) when given.
fn table_layout(
    paths: &ResolvedPaths,
    settings: &Settings,
    lang: Option<&str>,
    table: Option<PathBuf>,
) -> Result<LanguageLayout> {
    let layout = LanguageLayout::resolve(paths, settings, lang)?;
    match table {
        Some(table) => layout.with_table(&absolutize(&table, &paths.project_root)),
        None => Ok(layout),
    }
}

fn load_settings(paths: &ResolvedPaths) -> Result<Settings> {
    load_config(&paths.config_path)?.settings()
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    // The project's own .env may move the config, so resolve twice.
    let initial = resolve_paths(&cwd, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.is_file() {
        dotenvy::from_path_override(&project_env)
            .with_context(|| format!("failed to load {}", project_env.display()))?;
    }

    resolve_paths(&cwd, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
