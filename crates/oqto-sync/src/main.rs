use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use serde::Serialize;

use oqto_sync::protocol::RunState;
use oqto_sync::supervisor::ServerStatus;
use oqto_sync::{
    ConnectionStatus, DirectoryStore, HttpTransport, ServerEndpoint, Settings, StaticDiscovery,
    SyncEngine, SyncStatus,
};

const APP_NAME: &str = "oqto-sync";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(&ctx, cmd).await
}

#[tokio::main]
async fn async_status(ctx: RuntimeContext, cmd: StatusCommand) -> Result<()> {
    handle_status(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Status(cmd) => async_status(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "oqto-sync - real-time state sync for opencode servers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream events from all servers until interrupted
    Run(RunCommand),
    /// Connect, wait for the first events, and print a summary
    Status(StatusCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServerArgs {
    /// Extra server as URL=DIRECTORY (repeatable)
    #[arg(long = "server", value_name = "URL=DIRECTORY", value_parser = parse_server)]
    servers: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    #[command(flatten)]
    servers: ServerArgs,
}

#[derive(Debug, Clone, Args)]
struct StatusCommand {
    #[command(flatten)]
    servers: ServerArgs,
    /// Print once and exit instead of refreshing
    #[arg(long)]
    once: bool,
    /// Seconds to wait for events before printing
    #[arg(long, value_name = "SECONDS", default_value = "5")]
    wait: u64,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    settings: Settings,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = resolve_config_file(common.config.clone())?;
        let settings = load_or_init_config(&config_file, &common)?;
        Ok(Self {
            common,
            config_file,
            settings,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("oqto_sync={level},oqto_sync_protocol={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The library logs through `log`.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .settings
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn start_engine(&self, extra: &ServerArgs) -> Result<SyncEngine> {
        let mut endpoints = self.settings.endpoints();
        for endpoint in &extra.servers {
            if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
        }
        if endpoints.is_empty() {
            return Err(anyhow!(
                "no servers configured; add [[discovery.servers]] to {} or pass --server URL=DIRECTORY",
                self.config_file.display()
            ));
        }
        info!("Syncing {} server(s)", endpoints.len());

        let transport = HttpTransport::new().context("creating HTTP transport")?;
        Ok(SyncEngine::start(
            self.settings.engine_config(),
            Arc::new(StaticDiscovery::new(endpoints)),
            Arc::new(transport),
        ))
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            text()
        };
        println!("{output}");
        Ok(())
    }
}

fn parse_server(text: &str) -> std::result::Result<ServerEndpoint, String> {
    let (url, directory) = text
        .split_once('=')
        .ok_or_else(|| format!("expected URL=DIRECTORY, got {text:?}"))?;
    let endpoint = ServerEndpoint::new(url.trim(), directory.trim());
    endpoint.validate().map_err(|e| e.to_string())?;
    Ok(endpoint)
}

// ============================================================================
// Commands
// ============================================================================

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let engine = ctx.start_engine(&cmd.servers)?;
    let mut status = engine.status();
    let mut store = engine.store();
    let mut last = status.borrow().clone();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                log_transitions(&last, &current);
                last = current;
            }
            changed = store.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = store.borrow_and_update().clone();
                for summary in summarize(&snapshot) {
                    debug!(
                        "{}: {} sessions, {} running, {} messages",
                        summary.directory, summary.sessions, summary.running, summary.messages
                    );
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn handle_status(ctx: &RuntimeContext, cmd: StatusCommand) -> Result<()> {
    let engine = ctx.start_engine(&cmd.servers)?;
    let wait = Duration::from_secs(cmd.wait);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                break;
            }
        }

        let report = StatusReport {
            connection: engine.status().borrow().clone(),
            directories: summarize(&engine.snapshot()),
        };
        ctx.print(&report, || report.to_text())?;
        if cmd.once {
            break;
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.settings, || format!("{:#?}", ctx.settings)),
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn log_transitions(previous: &SyncStatus, current: &SyncStatus) {
    for server in &current.servers {
        let before = previous
            .servers
            .iter()
            .find(|s| s.url == server.url && s.directory == server.directory)
            .map(|s| s.status);
        if before == Some(server.status) {
            continue;
        }
        match server.status {
            ConnectionStatus::Failed => error!(
                "{} ({}) failed after {} attempts",
                server.url, server.directory, server.retry_count
            ),
            ConnectionStatus::Error => warn!(
                "{} ({}) disconnected, retry {}",
                server.url, server.directory, server.retry_count
            ),
            status => info!("{} ({}) is {}", server.url, server.directory, status),
        }
    }
    if previous.connected != current.connected {
        info!(
            "Sync {} ({} servers)",
            if current.connected { "online" } else { "offline" },
            current.server_count
        );
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Serialize)]
struct DirectorySummary {
    directory: String,
    ready: bool,
    sessions: usize,
    running: usize,
    messages: usize,
    compacting: usize,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    connection: SyncStatus,
    directories: Vec<DirectorySummary>,
}

impl StatusReport {
    fn to_text(&self) -> String {
        let mut out = format!(
            "connected: {}  servers: {}  discovering: {}\n",
            self.connection.connected, self.connection.server_count, self.connection.discovering
        );
        for ServerStatus {
            url,
            directory,
            status,
            retry_count,
        } in &self.connection.servers
        {
            out.push_str(&format!("  {url} ({directory}): {status}"));
            if *retry_count > 0 {
                out.push_str(&format!(" [retry {retry_count}]"));
            }
            out.push('\n');
        }
        for summary in &self.directories {
            out.push_str(&format!(
                "{}: {} sessions ({} running), {} messages",
                summary.directory, summary.sessions, summary.running, summary.messages
            ));
            if summary.compacting > 0 {
                out.push_str(&format!(", {} compacting", summary.compacting));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

fn summarize(store: &DirectoryStore) -> Vec<DirectorySummary> {
    let mut summaries: Vec<DirectorySummary> = store
        .directories()
        .map(|(directory, state)| DirectorySummary {
            directory: directory.to_string(),
            ready: state.ready,
            sessions: state.sessions.len(),
            running: state
                .session_status
                .values()
                .filter(|s| **s == RunState::Running)
                .count(),
            messages: state.message_count(),
            compacting: state.compaction.values().filter(|c| c.is_compacting).count(),
        })
        .collect();
    summaries.sort_by(|a, b| a.directory.cmp(&b.directory));
    summaries
}

// ============================================================================
// Configuration files
// ============================================================================

fn resolve_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

fn load_or_init_config(path: &Path, common: &CommonOpts) -> Result<Settings> {
    if !path.exists() {
        if common.dry_run {
            info!("dry-run: would create default config at {}", path.display());
        } else {
            write_default_config(path)?;
        }
    }

    Settings::load(path).with_context(|| format!("loading config from {}", path.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let settings = Settings::default();
    let toml = toml::to_string_pretty(&settings).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("#\n# Add servers to sync with:\n");
    buffer.push_str("# [[discovery.servers]]\n");
    buffer.push_str("# url = \"http://localhost:4096\"\n");
    buffer.push_str("# directory = \"/path/to/project\"\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        let expanded = shellexpand::full(text).context("expanding path")?;
        Ok(PathBuf::from(expanded.to_string()))
    } else {
        Ok(path)
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
