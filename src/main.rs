// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use firm_map::{load_csv, logging, Config, FirmStore, MarkerSetReconciler, RowSource};

#[derive(Parser)]
#[command(name = "firm-map", version, about = "Firm office locations on a map")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open the terminal map viewer (default)
    View,
    /// Load a spreadsheet export into the store
    Import {
        /// CSV file; any headers, one firm office per record
        csv: PathBuf,
    },
    /// Check configuration and stored rows
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::View);

    init_logging(&command)?;
    let config = Config::load();

    match command {
        Command::View => run_ui_mode(&config),
        Command::Import { csv } => run_import(&config, &csv),
        Command::Check => run_check(&config),
    }
}

/// Installed before `Config::load` so its fallback warnings are kept.
/// The viewer owns the terminal and logs to a file instead.
fn init_logging(command: &Command) -> Result<()> {
    match command {
        Command::View => logging::init_file(&Config::log_path()),
        _ => logging::init_stderr(),
    }
}

fn run_import(config: &Config, csv_path: &Path) -> Result<()> {
    println!("🗺️  Importing firm locations");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading CSV...");
    let rows = load_csv(csv_path)?;
    println!("✓ Loaded {} rows from {:?}", rows.len(), csv_path);

    // Report what the viewer would drop before writing anything
    let reconciler = MarkerSetReconciler::with_precision(config.classifier(), config.precision);
    let batch = reconciler.prepare(&rows);
    println!(
        "✓ {} mappable, {} rejected, {} duplicates",
        batch.records.len(),
        batch.rejected,
        batch.duplicates
    );

    println!("\n💾 Writing to {:?}...", config.db_path);
    let store = FirmStore::open(&config.db_path)?;
    let inserted = store.import_rows(&rows)?;
    let total = store.row_count()?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Imported {} rows ({} total in store)", inserted, total);

    Ok(())
}

fn run_check(config: &Config) -> Result<()> {
    println!("🔍 Firm map check");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Database:        {:?}", config.db_path);
    println!("Refresh every:   {}s", config.refresh_every.as_secs());
    println!("Coordinate precision: {} decimals", config.precision);

    let store = FirmStore::open(&config.db_path)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let (rows, last_updated) = runtime.block_on(async {
        let rows = store.fetch_rows().await?;
        let last_updated = store.fetch_last_updated().await?;
        Ok::<_, firm_map::SourceError>((rows, last_updated))
    })?;

    let reconciler = MarkerSetReconciler::with_precision(config.classifier(), config.precision);
    let batch = reconciler.prepare(&rows);

    println!("\nRows:            {}", rows.len());
    println!("Mappable:        {}", batch.records.len());
    println!("Rejected:        {}", batch.rejected);
    println!("Duplicates:      {}", batch.duplicates);
    match last_updated {
        Some(time) => println!("Last updated:    {}", firm_map::status::format_month_day_year(time)),
        None => println!("Last updated:    unavailable"),
    }

    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    for prepared in &batch.records {
        *by_category.entry(prepared.record.category.as_str()).or_default() += 1;
    }
    println!("\nCategories:");
    for (category, count) in by_category {
        println!("  {:<16} {}", category, count);
    }

    Ok(())
}

#[cfg(feature = "tui")]
fn run_ui_mode(config: &Config) -> Result<()> {
    use firm_map::PasswordGate;
    use std::sync::Arc;

    let store = FirmStore::open(&config.db_path)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let watcher = {
        let _context = runtime.enter();
        store.spawn_change_watcher(config.watch_every)
    };

    let source: Arc<dyn RowSource> = Arc::new(store);
    let mut app = ui::App::new(
        runtime.handle().clone(),
        source,
        config.session_settings(),
        config.refresh_every,
        PasswordGate::new(config.password.clone()),
    );
    let result = ui::run_ui(&mut app);

    watcher.abort();
    result
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_config: &Config) -> Result<()> {
    eprintln!("❌ TUI mode not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use the API: cargo run --bin firm-server --features server");
    std::process::exit(1);
}
