use std::path::PathBuf;
use std::sync::Arc;

use facet::Facet;
use figue as args;
use tdump_parse::{DiscoveredDumps, DumpStore, ParseOptions};
use tdump_types::{ThreadDumpSnapshot, VendorFormat};
use tdump_waitgraph::{FinalizeOptions, NoAdvice};
use tracing::debug;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Print the full report as JSON instead of a text summary.
    #[facet(args::named, default)]
    json: bool,
    /// Skip detection: hotspot, openjdk, jrockit, ibm or fallback.
    #[facet(args::named, default)]
    format: Option<String>,
    /// Advisory worker threads.
    #[facet(args::named, default)]
    workers: Option<usize>,
    #[facet(args::positional, default)]
    files: Vec<String>,
}

struct Config {
    json: bool,
    format: Option<VendorFormat>,
    workers: usize,
    files: Vec<PathBuf>,
}

#[derive(Facet)]
struct FileReport {
    path: String,
    dumps: DiscoveredDumps,
}

#[derive(Facet)]
struct Report {
    files: Vec<FileReport>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cfg = config_from_cli(cli)?;
    if cfg.files.is_empty() {
        return Err("no dump files given (try --help)".to_string());
    }

    debug!(files = cfg.files.len(), workers = cfg.workers, format = ?cfg.format, "parsing");
    let options = ParseOptions {
        format: cfg.format,
        finalize: FinalizeOptions {
            advisory_workers: cfg.workers,
            ..FinalizeOptions::default()
        },
        ..ParseOptions::default()
    };
    let store = DumpStore::new();
    store.parse_files(&cfg.files, &options, Arc::new(NoAdvice));

    // keep the command-line order, not the store's
    let mut found = store.into_inner();
    let files: Vec<FileReport> = cfg
        .files
        .iter()
        .filter_map(|path| {
            found.remove(path).map(|dumps| FileReport {
                path: path.display().to_string(),
                dumps,
            })
        })
        .collect();

    if cfg.json {
        let json = facet_json::to_string_pretty(&Report { files })
            .map_err(|e| format!("encode report: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let mut failed = false;
    for file in &files {
        print_file(file);
        failed |= file.dumps.error.is_some();
    }
    if failed {
        return Err("some files could not be read completely".to_string());
    }
    Ok(())
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("tdump")
                .description("Parse JVM thread dumps and report lock contention and deadlocks")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn config_from_cli(cli: Cli) -> Result<Config, String> {
    let format = match cli.format.or_else(|| std::env::var("TDUMP_FORMAT").ok()) {
        Some(name) => Some(
            VendorFormat::from_name(&name).ok_or_else(|| format!("unknown dump format '{name}'"))?,
        ),
        None => None,
    };

    let workers = match cli.workers {
        Some(n) => n,
        None => match std::env::var("TDUMP_WORKERS") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid TDUMP_WORKERS '{raw}': {e}"))?,
            Err(_) => FinalizeOptions::default().advisory_workers,
        },
    };

    Ok(Config {
        json: cli.json,
        format,
        workers: workers.max(1),
        files: cli.files.into_iter().map(PathBuf::from).collect(),
    })
}

fn print_file(file: &FileReport) {
    println!("== {}", file.path);
    for warning in &file.dumps.warnings {
        println!("  warning: {warning}");
    }
    if file.dumps.snapshots.is_empty() && file.dumps.error.is_none() {
        println!("  no thread dumps found");
    }
    for snapshot in &file.dumps.snapshots {
        print_snapshot(snapshot);
    }
    if let Some(err) = &file.dumps.error {
        println!("  error: {err}");
    }
}

fn print_snapshot(snap: &ThreadDumpSnapshot) {
    println!();
    println!(
        "Dump #{} ({}, line {}){}",
        snap.index + 1,
        snap.vendor,
        snap.start_line,
        snap.start_time
            .as_deref()
            .map(|t| format!(" taken {t}"))
            .unwrap_or_default()
    );
    if let Some(version) = &snap.version {
        println!("  {version}");
    }
    let c = &snap.counts;
    println!(
        "  threads: {} total, {} running, {} blocked, {} waiting, {} sleeping, {} locking, {} gc",
        c.total, c.running, c.blocked, c.waiting, c.sleeping, c.locking, c.gc
    );
    println!("  health: {}", snap.health.as_str());

    match &snap.deadlock {
        Some(chain) => {
            println!();
            for line in chain.narrative.lines() {
                println!("  {line}");
            }
        }
        None if snap.vendor_reported_deadlock => {
            println!("  the JVM reported a deadlock that could not be rebuilt from the stacks");
        }
        None => {}
    }

    if !snap.blocking_tree.is_empty() {
        println!();
        println!("  Blocking chains:");
        for line in snap.blocking_tree.render().lines() {
            println!("    {line}");
        }
    }
}
