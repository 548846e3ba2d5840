use std::io;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::error;
use tracing_subscriber::EnvFilter;

use etcd_recovery::cliui::MenuPrompt;
use etcd_recovery::models::{RepairMode, DEFAULT_CONFIG_FILENAME};
use etcd_recovery::{commands_exec, commands_repair, commands_select};

const EXIT_ERROR: i32 = 1;

#[derive(Parser)]
#[command(
    name = "etcd-recovery",
    version,
    about = "A tool to automatically recover an etcd cluster when quorum is lost"
)]
struct Cli {
    /// Path to etcd cluster hosts config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILENAME)]
    config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// etcd cluster repair mode
    #[arg(short, long, global = true, value_enum, default_value_t = RepairMode::Both)]
    mode: RepairMode,

    /// Command to execute against target host(s)
    #[arg(short = 'e', long = "command", global = true, default_value = "")]
    user_command: String,

    #[command(subcommand)]
    action: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select the best member to recover the cluster from
    Select,
    /// Perform etcd repair operations
    #[command(long_about = "Perform etcd repair operations on target VMs.\n\
        Supported Modes:\n\
        \x20 - add: Add a new member to an existing cluster\n\
        \x20 - create: Creates a single-member etcd cluster\n\
        \x20 - both: Run both create and add actions sequentially")]
    Repair,
    /// Execute command against host(s)
    Exec,
    /// Prints the version of etcd-recovery
    Version,
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(error) = run(cli) {
        error!("Error: {error:#}");
        std::process::exit(EXIT_ERROR);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.action {
        Commands::Select => commands_select::run(&cli.config)?,
        Commands::Repair => commands_repair::run(&cli.config, cli.mode, &MenuPrompt)?,
        Commands::Exec => commands_exec::run(&cli.config, &cli.user_command, &MenuPrompt)?,
        Commands::Version => print_version(),
        Commands::Completion { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "etcd-recovery", &mut io::stdout());
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

fn print_version() {
    println!("etcd-recovery version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Git SHA: {}",
        option_env!("GIT_SHA").unwrap_or("Not provided (set GIT_SHA at build time)")
    );
    println!(
        "OS/Arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}
