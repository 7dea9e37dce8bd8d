use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell as CompShell};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use expf::cancel::CancelSignal;
use expf::commands::{compare, load};
use expf::compare::DEFAULT_TOLERANCE;

#[derive(Parser)]
#[command(name = "expf")]
#[command(version)]
#[command(about = "Benchmark HTTP servers with external load generators")]
#[command(long_about = None)]
struct Cli {
    /// Debug logging (overridden by EXPF_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a server under test and drive load against it
    Load {
        /// Runner backend (local, docker, vanilla, nsolid)
        #[arg(long = "runner")]
        runner: Option<String>,
        /// Test directory or test file
        #[arg(long = "test")]
        test: Option<String>,
        /// Working directory (mounted into containers, holds results/)
        #[arg(long = "cwd")]
        cwd: Option<PathBuf>,
        /// Repository passed to container runners
        #[arg(long = "repo")]
        repo: Option<String>,
        /// Git ref of --repo
        #[arg(long = "repo-ref")]
        repo_ref: Option<String>,
        /// Node.js version
        #[arg(long = "node")]
        node: Option<String>,
        /// Base OS of container runner images
        #[arg(long = "os")]
        os: Option<String>,
        /// package.json overrides as a JSON object
        #[arg(long = "overrides")]
        overrides: Option<String>,
        /// Run the server on uWebSockets.js
        #[arg(long = "uws")]
        uws: bool,
        /// Load duration (e.g. "30s", "2m")
        #[arg(long = "duration")]
        duration: Option<String>,
        /// Concurrent connections
        #[arg(long = "connections")]
        connections: Option<u32>,
        /// Target requests per second
        #[arg(long = "rate")]
        rate: Option<u32>,
        /// Extra headers in format "Key: Value"
        #[arg(short = 'H', long = "header", action = ArgAction::Append)]
        headers: Vec<String>,
        /// Run every request concurrently
        #[arg(long = "parallel")]
        parallel: bool,
        /// Load generator (autocannon, wrk2, in-process); repeatable
        #[arg(long = "generator", action = ArgAction::Append)]
        generators: Vec<String>,
        /// How long to wait for the server to become ready
        #[arg(long = "ready-timeout")]
        ready_timeout: Option<String>,
        /// Port the server listens on
        #[arg(long = "port")]
        port: Option<u16>,
        /// Rebuild runner images without cache
        #[arg(long = "force-rebuild")]
        force_rebuild: bool,
        /// Config file (default: ./expf.config.json)
        #[arg(long = "config")]
        config: Option<PathBuf>,
        /// Do not write the result file
        #[arg(long = "no-write")]
        no_write: bool,
        /// Print the run result as JSON on stdout
        #[arg(long = "json")]
        json: bool,
    },
    /// Compare two saved results
    Compare {
        /// Baseline result file
        baseline: PathBuf,
        /// Candidate result file
        candidate: PathBuf,
        /// Relative change treated as noise
        #[arg(long = "tolerance", default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f64,
        /// Print the comparison as JSON
        #[arg(long = "json")]
        json: bool,
        /// Exit non-zero when any metric regressed
        #[arg(long = "fail-on-regression")]
        fail_on_regression: bool,
    },
    /// Generate shell completions (internal)
    #[command(hide = true)]
    Completions {
        /// Shell: bash, zsh, fish
        shell: String,
    },
    /// Generate man page (internal)
    #[command(hide = true)]
    Man,
}

pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    if atty::is(atty::Stream::Stdout) {
        println!("{} {}", "expf".cyan().bold(), version.bright_black());
    } else {
        println!("expf {}", version);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("EXPF_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Cancel `signal` on the first SIGINT or SIGTERM.
fn install_signal_handlers(signal: CancelSignal) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal as unix_signal, SignalKind};
            let mut terminate = match unix_signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot listen for SIGTERM");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        signal.cancel("received SIGINT");
                    }
                    return;
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        signal.cancel("received SIGINT");
                    }
                }
                _ = terminate.recv() => signal.cancel("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.cancel("received Ctrl-C");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if matches!(cli.command, Commands::Load { json: false, .. }) {
        print_banner();
    }

    match cli.command {
        Commands::Load {
            runner,
            test,
            cwd,
            repo,
            repo_ref,
            node,
            os,
            overrides,
            uws,
            duration,
            connections,
            rate,
            headers,
            parallel,
            generators,
            ready_timeout,
            port,
            force_rebuild,
            config,
            no_write,
            json,
        } => {
            let cancel = CancelSignal::new();
            install_signal_handlers(cancel.clone());
            load::handle_load(
                load::LoadArgs {
                    runner,
                    test,
                    cwd,
                    repo,
                    repo_ref,
                    node,
                    os,
                    overrides,
                    uws,
                    duration,
                    connections,
                    rate,
                    headers,
                    parallel,
                    generators,
                    ready_timeout,
                    port,
                    force_rebuild,
                    config,
                    no_write,
                    json,
                },
                cancel,
            )
            .await?;
        }
        Commands::Compare {
            baseline,
            candidate,
            tolerance,
            json,
            fail_on_regression,
        } => {
            compare::handle_compare(compare::CompareArgs {
                baseline,
                candidate,
                tolerance,
                json,
                fail_on_regression,
            })
            .await?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            let sh = match shell.as_str() {
                "bash" => CompShell::Bash,
                "zsh" => CompShell::Zsh,
                "fish" => CompShell::Fish,
                "powershell" | "pwsh" => CompShell::PowerShell,
                "elvish" => CompShell::Elvish,
                other => {
                    eprintln!(
                        "Unsupported shell: {} (use bash|zsh|fish|powershell|elvish)",
                        other
                    );
                    std::process::exit(2);
                }
            };
            generate(sh, &mut cmd, name, &mut std::io::stdout());
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut std::io::stdout())?;
        }
    }

    Ok(())
}
