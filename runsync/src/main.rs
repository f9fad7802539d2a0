//! `runsync`: keep a run directory in sync with a remote store while the run's process
//! executes.
//!
//! The remote store is a local mirror directory (`--mirror`), laid out the way
//! [`MirrorStore`] documents.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use runsync::context::{RunContext, RunPaths, generate_run_id};
use runsync::coordinator::{RunEnvironment, RunManager};
use runsync::core::lifecycle::ResumeMode;
use runsync::core::policy::SavePolicy;
use runsync::error::SyncError;
use runsync::exit_codes;
use runsync::io::config::{SyncConfig, load_config, write_config};
use runsync::io::store::{MirrorStore, RemoteStore};
use runsync::io::wire_channel::WireClient;
use runsync::logging;

#[derive(Parser)]
#[command(
    name = "runsync",
    version,
    about = "Sync a run directory to a remote store while its process runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RunArgs {
    /// Run directory watched for files (created if missing).
    #[arg(long, default_value = "run")]
    run_dir: PathBuf,
    /// Run id; a random one is generated when omitted.
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = "default")]
    entity: String,
    #[arg(long, default_value = "uncategorized")]
    project: String,
    /// Resume mode (never, auto, must). Overrides the config file.
    #[arg(long)]
    resume: Option<ResumeMode>,
    /// Save policy for matching files as POLICY:GLOB, policy one of end, live, throttled.
    #[arg(long = "save", value_name = "POLICY:GLOB", value_parser = parse_save)]
    save: Vec<(SavePolicy, String)>,
    /// Mirror directory standing in for the remote store.
    #[arg(long, default_value = ".runsync-mirror")]
    mirror: PathBuf,
    /// Config file (default: <run-dir>/.runsync/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a program and sync its run directory until it exits.
    Run {
        #[command(flatten)]
        args: RunArgs,
        /// Program and its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Sync for a process that is already running.
    Attach {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        pid: u32,
        /// File or named pipe carrying the process's stdout.
        #[arg(long)]
        stdout: Option<PathBuf>,
        /// File or named pipe carrying the process's stderr.
        #[arg(long)]
        stderr: Option<PathBuf>,
        /// Wire channel port the process listens on.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = "run")]
        run_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the defaults to the config path if no file exists there.
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { args, command } => cmd_run(&args, &command),
        Command::Attach {
            args,
            pid,
            stdout,
            stderr,
            port,
        } => cmd_attach(&args, pid, stdout.as_deref(), stderr.as_deref(), port),
        Command::Config {
            run_dir,
            config,
            init,
        } => cmd_config(&run_dir, config.as_deref(), init),
    }
}

fn parse_save(raw: &str) -> Result<(SavePolicy, String), String> {
    let (policy, glob) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected POLICY:GLOB, got {raw:?}"))?;
    let policy = policy.parse::<SavePolicy>().map_err(|e| e.to_string())?;
    if glob.is_empty() {
        return Err("save glob must not be empty".to_string());
    }
    Ok((policy, glob.to_string()))
}

fn config_path(run_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| RunPaths::new(run_dir).config_path, Path::to_path_buf)
}

fn cmd_config(run_dir: &Path, explicit: Option<&Path>, init: bool) -> Result<i32> {
    let path = config_path(run_dir, explicit);
    let cfg = load_config(&path)?;
    if init && !path.exists() {
        write_config(&path, &cfg)?;
        eprintln!("wrote {}", path.display());
    }
    print!("{}", toml::to_string_pretty(&cfg).context("serialize config toml")?);
    Ok(exit_codes::OK)
}

/// Build the manager and establish the run. `Err` carries the exit code to use.
fn prepare(args: &RunArgs) -> Result<RunManager, i32> {
    let mut cfg = match load_config(&config_path(&args.run_dir, args.config.as_deref())) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("runsync: {err:#}");
            return Err(exit_codes::INVALID);
        }
    };
    if let Some(mode) = args.resume {
        cfg.resume.mode = mode;
    }
    let run_id = args.run_id.clone().unwrap_or_else(generate_run_id);
    let ctx = Arc::new(RunContext::new(
        run_id,
        args.entity.clone(),
        args.project.clone(),
        &args.run_dir,
    ));
    let store: Arc<dyn RemoteStore> =
        Arc::new(MirrorStore::new(&args.mirror).with_file_names(cfg.policy.files.clone()));
    let env = run_environment(&ctx, &cfg);

    let setup = || -> Result<RunManager, SyncError> {
        let mut manager = RunManager::new(ctx, store, cfg)?;
        for (policy, glob) in &args.save {
            manager.register_save_policy(glob, *policy)?;
        }
        let outcome = manager.init_run(&env)?;
        if outcome.resumed {
            eprintln!(
                "runsync: resuming run {} from step {}",
                manager.ctx().run_id,
                outcome.starting_step
            );
        }
        Ok(manager)
    };
    setup().map_err(|err| {
        eprintln!("runsync: {err}");
        exit_codes::INVALID
    })
}

fn run_environment(ctx: &RunContext, cfg: &SyncConfig) -> RunEnvironment {
    let config_file = ctx.path_of(&cfg.policy.files.config);
    let config = std::fs::read_to_string(&config_file)
        .ok()
        .and_then(|text| serde_yaml::from_str::<Value>(&text).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    RunEnvironment {
        config,
        host: std::env::var("HOSTNAME").ok(),
        ..RunEnvironment::default()
    }
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Release))
        .context("install interrupt handler")?;
    Ok(flag)
}

fn finish(mut manager: RunManager, exit_code: i32) -> i32 {
    let report = manager.shutdown(exit_code);
    eprintln!("{}", report.render());
    exit_code
}

fn cmd_run(args: &RunArgs, command: &[String]) -> Result<i32> {
    let Some((program, program_args)) = command.split_first() else {
        bail!("missing program to run");
    };
    let interrupt = interrupt_flag()?;
    let mut manager = match prepare(args) {
        Ok(manager) => manager,
        Err(code) => return Ok(code),
    };
    if let Err(err) = manager.run_user_process(program, program_args) {
        eprintln!("runsync: {err}");
        return Ok(finish(manager, exit_codes::INVALID));
    }
    let code = match manager.await_completion(&interrupt) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runsync: {err}");
            exit_codes::UNKNOWN
        }
    };
    Ok(finish(manager, code))
}

fn open_reader(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(Box::new(file))
}

fn cmd_attach(
    args: &RunArgs,
    pid: u32,
    stdout: Option<&Path>,
    stderr: Option<&Path>,
    port: Option<u16>,
) -> Result<i32> {
    let interrupt = interrupt_flag()?;
    let stdout = stdout.map(open_reader).transpose()?;
    let stderr = stderr.map(open_reader).transpose()?;
    let wire = port
        .map(|port| {
            WireClient::connect(port).with_context(|| format!("connect wire channel on {port}"))
        })
        .transpose()?;
    let mut manager = match prepare(args) {
        Ok(manager) => manager,
        Err(code) => return Ok(code),
    };
    if let Err(err) = manager.attach_to_existing_process(pid, stdout, stderr, wire) {
        eprintln!("runsync: {err}");
        return Ok(finish(manager, exit_codes::INVALID));
    }
    let code = match manager.await_completion(&interrupt) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runsync: {err}");
            exit_codes::UNKNOWN
        }
    };
    Ok(finish(manager, code))
}
