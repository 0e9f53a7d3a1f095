//! Worldbook CLI — build a worldbook from a long text with a completion command.
//!
//! Usage:
//!   worldbook run <input> [--command "llm -m model"] [--config pipeline.yaml] [--db path]
//!   worldbook resume <input> | repair <input>
//!   worldbook status | history | rollback <id> | export | abandon [--db path]

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use worldbook::pipeline::{event_channel, fingerprint, PipelineEvent};
use worldbook::splitter::{split_text, DEFAULT_CHUNK_CHARS};
use worldbook::worldbook::{export, ExportFormat};
use worldbook::{
    CommandClient, OpenStore, PipelineConfig, PipelineContext, Scheduler, SqliteStateStore,
    StateStore,
};

#[derive(Parser)]
#[command(
    name = "worldbook",
    version,
    about = "Resumable LLM pipeline that builds a worldbook from long text"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite state database
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Pipeline configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run over a text file (resumes automatically if one is stored for it)
    Run {
        input: PathBuf,
        /// Completion command; receives the prompt on stdin
        #[arg(long, default_value = "llm")]
        command: String,
        /// Maximum characters per initial chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_CHARS)]
        chunk_chars: usize,
        /// Discard any stored run and history first
        #[arg(long)]
        fresh: bool,
    },
    /// Resume the stored run for a text file
    Resume {
        input: PathBuf,
        #[arg(long, default_value = "llm")]
        command: String,
    },
    /// Re-run failed items of the stored run
    Repair {
        input: PathBuf,
        #[arg(long, default_value = "llm")]
        command: String,
    },
    /// Show queue status of the stored run
    Status,
    /// List history records
    History,
    /// Roll the worldbook back to before a history record
    Rollback {
        /// History record sequence id
        id: i64,
    },
    /// Export the accumulated worldbook
    Export {
        #[arg(long, value_enum, default_value_t = FormatArg::Tree)]
        format: FormatArg,
        /// Write here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Forget the stored run
    Abandon,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Tree,
    Entries,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Tree => ExportFormat::Tree,
            FormatArg::Entries => ExportFormat::Entries,
        }
    }
}

/// Get the default database path (~/.local/share/worldbook/state.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("worldbook");
    std::fs::create_dir_all(&dir).ok();
    dir.join("state.db")
}

fn open_store(db: Option<PathBuf>) -> Result<Arc<dyn StateStore>, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    let store =
        SqliteStateStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(Arc::new(store))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, String> {
    match path {
        Some(path) => PipelineConfig::load(path).map_err(|e| format!("Failed to load config: {}", e)),
        None => Ok(PipelineConfig::default()),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Restore the stored run whatever input it belongs to.
fn load_stored(store: &Arc<dyn StateStore>, config: &PipelineConfig) -> Result<PipelineContext, String> {
    let state = store
        .load_run_state()
        .map_err(|e| format!("Failed to load run state: {}", e))?
        .ok_or_else(|| "no stored run".to_string())?;
    PipelineContext::restore(store.clone(), &state.file_fingerprint, config.history.clone())
        .map_err(|e| format!("Failed to restore run: {}", e))?
        .ok_or_else(|| "no stored run".to_string())
}

fn build_scheduler(command: &str, store: Arc<dyn StateStore>, config: PipelineConfig) -> Result<Scheduler, String> {
    let client = CommandClient::from_command_line(command)
        .ok_or_else(|| "completion command is empty".to_string())?;
    let (tx, mut rx) = event_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::Progress { done, total } => eprintln!("[{}/{}]", done, total),
                PipelineEvent::ItemSplit { index, title } => {
                    eprintln!("split #{} {} after overflow", index, title)
                }
                PipelineEvent::ItemFailed { index, title, reason } => {
                    eprintln!("failed #{} {}: {}", index, title, reason)
                }
                _ => {}
            }
        }
    });
    Ok(Scheduler::new(Arc::new(client), store, config).with_events(tx))
}

/// Scheduler for commands that never call the backend (rollback, abandon).
fn offline_scheduler(store: Arc<dyn StateStore>, config: PipelineConfig) -> Scheduler {
    Scheduler::new(Arc::new(CommandClient::new("true", Vec::new())), store, config)
}

/// Pause the run on Ctrl-C; the stored state stays resumable.
fn pause_on_ctrl_c(scheduler: &Scheduler) {
    let handle = scheduler.pause_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Pausing; in-flight requests will finish...");
            handle.pause();
        }
    });
}

fn print_summary(summary: &worldbook::RunSummary, ctx: &PipelineContext) {
    println!(
        "{} succeeded, {} failed, {} split{}",
        summary.succeeded,
        summary.failed,
        summary.split,
        if summary.paused { " (paused)" } else { "" }
    );
    println!(
        "Worldbook: {} entries in {} categories",
        ctx.worldbook().entry_count(),
        ctx.worldbook().category_count()
    );
}

async fn cmd_run(
    store: Arc<dyn StateStore>,
    config: PipelineConfig,
    input: &Path,
    command: &str,
    chunk_chars: usize,
    fresh: bool,
) -> i32 {
    let text = match std::fs::read_to_string(input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", input.display(), e);
            return 1;
        }
    };
    let fp = fingerprint(&text);

    if fresh {
        if let Err(e) = store.clear_run_state().and_then(|_| store.clear_history()) {
            eprintln!("Error: {}", e);
            return 1;
        }
    }

    let mut ctx = match PipelineContext::restore(store.clone(), &fp, config.history.clone()) {
        Ok(Some(ctx)) => {
            println!("Resuming stored run at item {} of {}", ctx.cursor() + 1, ctx.items().len());
            ctx
        }
        Ok(None) => {
            let items = split_text(&text, chunk_chars);
            if items.is_empty() {
                eprintln!("Error: {} has no text", input.display());
                return 1;
            }
            println!("Starting run over {} chunks", items.len());
            PipelineContext::new(items, fp, store.clone(), config.history.clone())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut scheduler = match build_scheduler(command, store, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    pause_on_ctrl_c(&scheduler);

    match scheduler.run(&mut ctx).await {
        Ok(summary) => {
            print_summary(&summary, &ctx);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_resume(
    store: Arc<dyn StateStore>,
    config: PipelineConfig,
    input: &Path,
    command: &str,
    repair: bool,
) -> i32 {
    let text = match std::fs::read_to_string(input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", input.display(), e);
            return 1;
        }
    };
    let mut ctx = match PipelineContext::restore(store.clone(), &fingerprint(&text), config.history.clone()) {
        Ok(Some(ctx)) => ctx,
        Ok(None) => {
            eprintln!("Error: no stored run for {}", input.display());
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut scheduler = match build_scheduler(command, store, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    pause_on_ctrl_c(&scheduler);

    if repair {
        match scheduler.repair(&mut ctx).await {
            Ok(summary) => {
                println!(
                    "Repaired {}, still failed {}, split {}",
                    summary.succeeded, summary.still_failed, summary.split
                );
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    } else {
        match scheduler.resume(&mut ctx).await {
            Ok(summary) => {
                print_summary(&summary, &ctx);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    }
}

fn cmd_status(store: &Arc<dyn StateStore>, config: &PipelineConfig) -> i32 {
    let ctx = match load_stored(store, config) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("{}", e);
            return 0;
        }
    };
    let counts = ctx.counts();
    println!("Fingerprint: {}", ctx.fingerprint());
    println!(
        "Items: {} total, {} done, {} pending, {} failed",
        counts.total(),
        counts.done,
        counts.pending,
        counts.failed
    );
    println!("Cursor: {}", ctx.cursor());
    println!("Entries: {}", ctx.worldbook().entry_count());
    for (index, reason) in ctx.failures() {
        let title = ctx.item(index).map(|i| i.title.as_str()).unwrap_or("");
        println!("  failed #{} {}: {}", index, title, reason);
    }
    0
}

fn cmd_history(store: &Arc<dyn StateStore>) -> i32 {
    let records = match store.list_history() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if records.is_empty() {
        println!("No history.");
        return 0;
    }
    println!("{:<6}  {:<6}  {:<24}  {:<8}  {}", "ID", "ITEM", "TITLE", "CHANGES", "TIME");
    for r in records {
        println!(
            "{:<6}  {:<6}  {:<24}  {:<8}  {}",
            r.sequence_id,
            r.work_item_index,
            r.title,
            r.changed_entries.len(),
            r.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    0
}

fn cmd_rollback(store: Arc<dyn StateStore>, config: PipelineConfig, id: i64) -> i32 {
    let mut ctx = match load_stored(&store, &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let mut scheduler = offline_scheduler(store, config);
    match scheduler.rollback(&mut ctx, id) {
        Ok(restored) => {
            println!(
                "Rolled back to before record {}: {} entries; resume continues from item {}",
                id,
                restored.entry_count(),
                ctx.cursor() + 1
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_export(store: &Arc<dyn StateStore>, format: FormatArg, output: Option<&Path>) -> i32 {
    let state = match store.load_run_state() {
        Ok(Some(s)) => s,
        Ok(None) => {
            eprintln!("Error: no stored run");
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let json = match export(&state.accumulated_worldbook, format.into()) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match output {
        Some(path) => match std::fs::write(path, json) {
            Ok(()) => {
                println!("Wrote {}", path.display());
                0
            }
            Err(e) => {
                eprintln!("Error: cannot write {}: {}", path.display(), e);
                1
            }
        },
        None => {
            println!("{}", json);
            0
        }
    }
}

fn cmd_abandon(store: Arc<dyn StateStore>, config: PipelineConfig) -> i32 {
    let ctx = match load_stored(&store, &config) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("{}", e);
            return 0;
        }
    };
    let mut scheduler = offline_scheduler(store, config);
    match scheduler.abandon(&ctx) {
        Ok(()) => {
            println!("Stored run abandoned.");
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let store = match open_store(cli.db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Run {
            input,
            command,
            chunk_chars,
            fresh,
        } => cmd_run(store, config, &input, &command, chunk_chars, fresh).await,
        Commands::Resume { input, command } => cmd_resume(store, config, &input, &command, false).await,
        Commands::Repair { input, command } => cmd_resume(store, config, &input, &command, true).await,
        Commands::Status => cmd_status(&store, &config),
        Commands::History => cmd_history(&store),
        Commands::Rollback { id } => cmd_rollback(store, config, id),
        Commands::Export { format, output } => cmd_export(&store, format, output.as_deref()),
        Commands::Abandon => cmd_abandon(store, config),
    };
    std::process::exit(code);
}
