use std::io;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use siper::commands::{self, AddOptions, DeleteTarget, StartOptions};
use siper::pins::{DEFAULT_BPFFS, PinPaths};

const DEFAULT_BLACKLIST: &str = "./blacklist.json";
const DEFAULT_OBJECT: &str = "./siper.o";

#[derive(Parser)]
#[command(name = "siper")]
#[command(about = "XDP IP-prefix blacklist firewall", long_about = None)]
struct Cli {
    /// Directory on the BPF filesystem holding siper's pins
    #[arg(long, global = true, value_name = "DIR", env = "SIPER_BPFFS", default_value = DEFAULT_BPFFS)]
    bpffs: PathBuf,
    /// Log debug details
    #[arg(short, long, global = true, action = ArgAction::SetTrue, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log errors
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the XDP object, attach it and push the blacklist
    #[command(alias = "run")]
    Start(StartCommand),
    /// Detach from an interface and remove every pin
    Stop(StopCommand),
    /// Add a rule to the blacklist file
    Add(AddCommand),
    /// Delete a rule from the blacklist file
    Del(DelCommand),
    /// Print the rules stored in the blacklist file
    List(PathArg),
    /// Print every key in the kernel trie
    DumpKeys,
    /// Print pass/drop counters summed across CPUs
    DumpMetrics(DumpMetricsCommand),
    /// Print the lifecycle state inferred from the pins
    Status,
}

#[derive(Args)]
struct PathArg {
    /// Blacklist JSON file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_BLACKLIST)]
    path: PathBuf,
}

#[derive(Args)]
struct StartCommand {
    /// Network interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    #[command(flatten)]
    blacklist: PathArg,
    /// Compiled XDP object file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_OBJECT)]
    object: PathBuf,
    /// Validate the blacklist and log the keys without touching the kernel
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

#[derive(Args)]
struct StopCommand {
    /// Network interface to detach from
    #[arg(long, value_name = "IFACE")]
    iface: String,
}

#[derive(Args)]
struct AddCommand {
    /// Network to block, e.g. 203.0.113.0/24
    #[arg(long, value_name = "CIDR")]
    cidr: String,
    #[command(flatten)]
    blacklist: PathArg,
    /// Where the rule came from
    #[arg(long, default_value = "")]
    source: String,
    /// Free-form note
    #[arg(long, default_value = "")]
    comment: String,
    /// Store the rule without enforcing it
    #[arg(long, action = ArgAction::SetTrue)]
    disabled: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["cidr", "id"])))]
struct DelCommand {
    /// Delete the rule for this network
    #[arg(long, value_name = "CIDR")]
    cidr: Option<String>,
    /// Delete the rule with this id
    #[arg(long, value_name = "ID")]
    id: Option<String>,
    #[command(flatten)]
    blacklist: PathArg,
}

#[derive(Args)]
struct DumpMetricsCommand {
    /// Emit JSON instead of the text report
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("siper error: {err:?}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let pins = PinPaths::in_dir(&cli.bpffs);

    match cli.command {
        Commands::Start(cmd) => {
            let opts = StartOptions {
                iface: cmd.iface,
                blacklist_path: cmd.blacklist.path,
                object_path: cmd.object,
                dry_run: cmd.dry_run,
            };
            commands::start(&pins, &opts)?;
        }
        Commands::Stop(cmd) => commands::stop(&pins, &cmd.iface)?,
        Commands::Add(cmd) => {
            let opts = AddOptions {
                blacklist_path: cmd.blacklist.path,
                cidr: cmd.cidr,
                source: cmd.source,
                comment: cmd.comment,
                enabled: !cmd.disabled,
            };
            commands::add(&pins, &opts)?;
        }
        Commands::Del(cmd) => {
            let target = match (cmd.cidr, cmd.id) {
                (Some(cidr), _) => DeleteTarget::Cidr(cidr),
                (None, Some(id)) => DeleteTarget::Id(id),
                (None, None) => bail!("either --cidr or --id is required"),
            };
            commands::delete(&pins, &cmd.blacklist.path, &target)?;
        }
        Commands::List(arg) => commands::list(&arg.path)?,
        Commands::DumpKeys => commands::dump_keys(&pins)?,
        Commands::DumpMetrics(cmd) => commands::dump_metrics(&pins, cmd.json)?,
        Commands::Status => commands::status(&pins)?,
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")
}
