//! nitra CLI - Distributed test runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nitra::channel::Channel;
use nitra::config::{self, Config, SlaveConfig};
use nitra::framework::FrameworkRegistry;
use nitra::master::{Master, ProcessLauncher};
use nitra::report::ConsoleReporter;
use nitra::runner::{self, CommandLauncher, RunnerExit};

#[derive(Parser)]
#[command(name = "nitra")]
#[command(about = "Distributed test runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "nitra.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test files
    Run(RunArgs),

    /// Serve a master over stdin/stdout
    #[command(hide = true)]
    Runner,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Files to run in addition to discovered ones
    files: Vec<String>,

    /// Number of local worker processes
    #[arg(short = 'p', long = "processes")]
    processes: Option<usize>,

    /// Remote host running its own runner, as host[:capacity]
    #[arg(long = "slave")]
    slaves: Vec<String>,

    /// Discover and run rspec files
    #[arg(long)]
    rspec: bool,

    /// Discover and run cucumber files
    #[arg(long)]
    cucumber: bool,

    /// Value of RAILS_ENV for workers
    #[arg(short, long)]
    environment: Option<String>,

    /// Recreate each worker's database from the schema first
    #[arg(long)]
    load_schema: bool,

    /// Migrate each worker's database first
    #[arg(long)]
    migrate: bool,

    /// Print the output of failing files as they finish
    #[arg(long)]
    print_failures: bool,

    /// Suppress the progress bar and timing
    #[arg(short, long)]
    quiet: bool,

    /// Show runner and worker diagnostics
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Runner stdout is the channel to the master, so logs always go to stderr.
    let log_level = match &cli.command {
        _ if cli.verbose => Level::DEBUG,
        Commands::Run(args) if args.debug => Level::DEBUG,
        Commands::Runner => Level::WARN,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match cli.command {
        Commands::Run(args) => {
            let code = runtime.block_on(run_files(&cli.config, args))?;
            drop(runtime);
            std::process::exit(code);
        }
        Commands::Runner => {
            let code = runtime.block_on(serve_runner())?;
            drop(runtime);
            std::process::exit(code);
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

/// Applies command line overrides on top of the configuration file.
fn apply_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(processes) = args.processes {
        config.nitra.process_count = processes;
    }
    if let Some(environment) = &args.environment {
        config.nitra.environment = environment.clone();
    }
    for slave in &args.slaves {
        config.slaves.push(SlaveConfig::parse(slave)?);
    }

    let mut frameworks = Vec::new();
    if args.rspec {
        frameworks.push("rspec".to_string());
    }
    if args.cucumber {
        frameworks.push("cucumber".to_string());
    }
    if !frameworks.is_empty() {
        config.nitra.frameworks = frameworks;
    } else if !args.files.is_empty() {
        // Explicit files replace discovery unless a framework is asked for too.
        config.nitra.frameworks.clear();
    }

    config.prepare.load_schema |= args.load_schema;
    config.prepare.migrate |= args.migrate;
    config.nitra.print_failures |= args.print_failures;
    config.nitra.quiet |= args.quiet;
    config.nitra.debug |= args.debug;
    Ok(())
}

async fn run_files(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut config = config::load_config_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    apply_overrides(&mut config, &args)?;

    let registry =
        FrameworkRegistry::from_config(&config.frameworks).context("Invalid framework configuration")?;
    let launcher = ProcessLauncher::current_exe(config.nitra.runner_command.as_deref())?;

    let abort = CancellationToken::new();
    let _signals = nitra::signal::watch(abort.clone());

    let mut reporter = ConsoleReporter::new(config.nitra.quiet, config.nitra.print_failures);
    let mut master = Master::new(config, registry, launcher)
        .with_files(args.files)
        .with_abort(abort);

    match master.run(|progress, result| reporter.on_progress(progress, result)).await? {
        Some(summary) => {
            reporter.finish(&summary);
            Ok(summary.exit_code())
        }
        None => Ok(1),
    }
}

async fn serve_runner() -> Result<i32> {
    let upstream = Channel::new("master", tokio::io::stdin(), tokio::io::stdout());
    let launcher = CommandLauncher::new().context("Failed to create fixture directory")?;

    let abort = CancellationToken::new();
    let _signals = nitra::signal::watch(abort.clone());

    match runner::serve(upstream, launcher, abort).await {
        Ok(RunnerExit::MasterLost) => Ok(1),
        Ok(_) => Ok(0),
        Err(e) => {
            error!("Runner failed: {}", e);
            Ok(1)
        }
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        let registry = FrameworkRegistry::from_config(&config.frameworks)?;
        for name in &config.nitra.frameworks {
            registry.get(name)?;
        }
        Ok((config, registry))
    });

    match checked {
        Ok((config, registry)) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Processes: {}", config.nitra.process_count);
            println!("  Environment: {}", config.nitra.environment);
            println!("  Discover: {}", config.nitra.frameworks.join(", "));
            println!("  History file: {}", config.nitra.history_file.display());

            let frameworks: Vec<String> = registry
                .iter()
                .map(|shim| format!("{} (order {})", shim.name(), shim.order()))
                .collect();
            println!("  Frameworks: {}", frameworks.join(", "));

            for slave in &config.slaves {
                println!("  Slave: {} ({} workers)", slave.host, slave.capacity);
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# nitra configuration file

[nitra]
# process_count = 8
environment = "nitra"
frameworks = ["rspec"]
history_file = "log/nitra_filemap.json"

# [[slaves]]
# host = "ci-box-2"
# capacity = 8
# command = "cd /srv/app && bundle exec nitra runner"

[prepare]
load_schema = false
migrate = false
commands = []

[frameworks.rspec]
worker_command = "bundle exec nitra-worker rspec"

# [frameworks.cucumber]
# worker_command = "bundle exec nitra-worker cucumber"
"#;

    let path = PathBuf::from("nitra.toml");
    if path.exists() {
        eprintln!("nitra.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created nitra.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  nitra run");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_files_replace_discovery() {
        let mut config = Config::default();
        let args = RunArgs {
            files: vec!["spec/a_spec.rb".to_string()],
            ..Default::default()
        };
        apply_overrides(&mut config, &args).unwrap();
        assert!(config.nitra.frameworks.is_empty());
    }

    #[test]
    fn test_framework_flags_and_slaves() {
        let mut config = Config::default();
        let args = RunArgs {
            cucumber: true,
            processes: Some(0),
            slaves: vec!["box:4".to_string()],
            migrate: true,
            ..Default::default()
        };
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.nitra.frameworks, vec!["cucumber"]);
        assert_eq!(config.nitra.process_count, 0);
        assert_eq!(config.slaves[0].capacity, 4);
        assert!(config.prepare.migrate);
        assert!(!config.prepare.load_schema);
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "nitra", "run", "-p", "3", "--slave", "box", "--print-failures", "spec/a_spec.rb",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.processes, Some(3));
                assert_eq!(args.slaves, vec!["box"]);
                assert!(args.print_failures);
                assert_eq!(args.files, vec!["spec/a_spec.rb"]);
            }
            _ => panic!("expected run"),
        }
    }
}
