//! Strand engine CLI
//!
//! Entry point for the `strand` command-line tool. Every command works on
//! a file-backed store directory shared by all processes pointed at it.

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use strand_engine::config::CONFIG_FILENAME;
use strand_engine::progs::builtin_registry;
use strand_engine::scheduler::{generate_owner_id, install_signal_handler};
use strand_engine::{
    Engine, EngineConfig, FileStrandStore, Runtime, ShutdownState, StrandStatus, SystemClock,
    WorkerPool,
};
use strand_provider::MemoryProvider;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Durable workflow engine for cloud resources", version)]
struct Cli {
    /// Store directory
    #[arg(long, short = 's', global = true, default_value = ".strand")]
    store: PathBuf,

    /// Engine config file (default: <store>/engine.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a strand
    Start {
        /// Prog name (e.g. Nic)
        prog: String,

        /// Subject the strand drives
        subject: String,

        /// Argument as key=value; values that parse as JSON are kept typed
        #[arg(long = "arg", short = 'a', value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Start at the prog's teardown label
        #[arg(long)]
        teardown: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one strand
    Status {
        id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List every strand
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Wake a strand
    Signal { id: String },

    /// Cancel a strand; it runs its prog's teardown chain
    Cancel { id: String },

    /// Re-activate a stuck strand at its current label
    Unstick { id: String },

    /// Run workers against the store
    Work {
        /// Worker threads (overrides config)
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,

        /// Simulated cloud snapshot (default: <store>/cloud.json)
        #[arg(long)]
        cloud: Option<PathBuf>,

        /// Describes before a simulated object becomes available
        #[arg(long, default_value_t = 2)]
        settle_after: u32,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("strand_engine=debug,strand_provider=debug,strand=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Start {
            prog,
            subject,
            args,
            teardown,
            json,
        } => run_start(&cli.store, &prog, &subject, &args, teardown, json),
        Commands::Status { id, json } => run_status(&cli.store, &id, json),
        Commands::List { json } => run_list(&cli.store, json),
        Commands::Signal { id } => {
            let status = exit_on_err("signal failed", open_engine(&cli.store).signal(&id));
            print_status(&status);
        }
        Commands::Cancel { id } => {
            let status = exit_on_err("cancel failed", open_engine(&cli.store).cancel(&id));
            print_status(&status);
        }
        Commands::Unstick { id } => {
            let status = exit_on_err("unstick failed", open_engine(&cli.store).unstick(&id));
            print_status(&status);
        }
        Commands::Work {
            workers,
            once,
            cloud,
            settle_after,
        } => run_work(&cli.store, cli.config, workers, once, cloud, settle_after),
    }
}

fn exit_on_err<T, E: std::fmt::Display>(context: &str, result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("Error: {}: {}", context, e);
            process::exit(1);
        }
    }
}

fn open_store(store_dir: &Path) -> FileStrandStore {
    exit_on_err("cannot open store", FileStrandStore::open(store_dir))
}

fn open_engine(store_dir: &Path) -> Engine {
    Engine::new(
        Arc::new(open_store(store_dir)),
        Arc::new(builtin_registry()),
        Arc::new(SystemClock),
    )
}

/// Parse `key=value` pairs into a JSON object.
fn parse_args(args: &[String]) -> Result<Value, String> {
    let mut map = Map::new();
    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            return Err(format!("expected KEY=VALUE, got {:?}", arg));
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}

fn run_start(store_dir: &Path, prog: &str, subject: &str, args: &[String], teardown: bool, json_output: bool) {
    let args = exit_on_err("invalid --arg", parse_args(args));
    let engine = open_engine(store_dir);

    let id = if teardown {
        engine.start_teardown(prog, subject, args)
    } else {
        engine.start(prog, subject, args)
    };
    let id = exit_on_err("start failed", id);

    if json_output {
        println!("{}", json!({ "id": id }));
    } else {
        println!("{}", id);
    }
}

fn run_status(store_dir: &Path, id: &str, json_output: bool) {
    let status = exit_on_err("status failed", open_engine(store_dir).status(id));
    if json_output {
        println!("{}", exit_on_err("serialize failed", serde_json::to_string_pretty(&status)));
    } else {
        print_status(&status);
    }
}

fn run_list(store_dir: &Path, json_output: bool) {
    let strands = exit_on_err("list failed", open_engine(store_dir).list());
    if json_output {
        println!("{}", exit_on_err("serialize failed", serde_json::to_string_pretty(&strands)));
        return;
    }
    if strands.is_empty() {
        println!("No strands");
        return;
    }
    for status in &strands {
        println!(
            "{}  {:<9} {}/{}  subject={}",
            status.id,
            format!("{:?}", status.state).to_lowercase(),
            status.prog_name,
            status.label,
            status.subject_id
        );
    }
}

fn print_status(status: &StrandStatus) {
    println!("Strand:   {}", status.id);
    println!("  Subject:  {}", status.subject_id);
    println!("  Position: {}/{} (depth {})", status.prog_name, status.label, status.depth);
    println!("  State:    {:?}", status.state);
    if let Some(at) = status.scheduled_at {
        println!("  Due:      {}", at.to_rfc3339());
    }
    if let Some(owner) = &status.leased_by {
        println!("  Leased:   {}", owner);
    }
    if status.cancel_requested {
        println!("  Cancel requested");
    }
    if status.attempts > 0 {
        println!("  Attempts: {}", status.attempts);
    }
    if let Some(error) = &status.last_error {
        println!("  Error:    {}", error);
    }
    if let Some(exitval) = &status.exitval {
        println!("  Result:   {}", exitval);
    }
}

fn run_work(
    store_dir: &Path,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    once: bool,
    cloud: Option<PathBuf>,
    settle_after: u32,
) {
    let config_path = config_path.unwrap_or_else(|| store_dir.join(CONFIG_FILENAME));
    let overrides = json!({ "workers": workers });
    let config = exit_on_err(
        "invalid configuration",
        EngineConfig::load(Some(config_path.as_path()), Some(overrides)),
    );

    let store = open_store(store_dir);
    let cloud_path = cloud.unwrap_or_else(|| store_dir.join("cloud.json"));
    let provider = exit_on_err(
        "cannot open simulated cloud",
        MemoryProvider::open(&cloud_path, settle_after),
    );

    let runtime = Runtime {
        store: Arc::new(store),
        registry: Arc::new(builtin_registry()),
        client: Arc::new(provider),
        clock: Arc::new(SystemClock),
        config,
    };

    if once {
        let reports = exit_on_err("poll failed", runtime.dispatcher(generate_owner_id()).poll_once());
        if reports.is_empty() {
            println!("Nothing due");
        }
        for report in reports {
            println!(
                "{}  {:?} after {} step(s) at {}/{}",
                report.strand_id, report.outcome, report.steps, report.prog_name, report.label
            );
        }
        return;
    }

    let shutdown = Arc::new(ShutdownState::new());
    exit_on_err("cannot install signal handler", install_signal_handler(Arc::clone(&shutdown)));

    let pool = exit_on_err("cannot start workers", WorkerPool::start(runtime, shutdown));
    eprintln!("Working {} (Ctrl-C to stop)", store_dir.display());
    pool.join();
}
