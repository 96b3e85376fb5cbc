//! `bk`: a thin `clap` front-end over the `Repository` command surface.
//! Resolves a `Config`, opens (or initializes) a repository, dispatches one
//! subcommand, and turns the result into a log line plus a clipped exit
//! code (§6/§7: argument errors exit 1, everything else exits the logged
//! error count).

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bk::config::{Config, ConfigOverrides, StoreTarget};
use bk::error::BkError;
use bk::logger::{Logger, ResourceSnapshot, Verbosity};
use bk::repo::{CancelFlag, Repository};

#[derive(Parser, Debug)]
#[command(name = "bk", author, version, about = "A deduplicating, content-addressed backup engine.")]
struct Args {
    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    profile: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the repository named by `BK_DIR`.
    Init {
        #[arg(long)]
        encrypt: bool,
    },
    /// Back up a directory tree as `backup-<name>-<timestamp>`.
    Backup {
        #[arg(long)]
        base: Option<String>,
        #[arg(long = "split-bits")]
        split_bits: Option<u32>,
        name: String,
        dir: PathBuf,
    },
    /// Restore a named backup under a target directory.
    Restore { name: String, dir: PathBuf },
    /// Read stdin and store it as `bits-<name>-<timestamp>`.
    Savebits {
        #[arg(long = "split-bits")]
        split_bits: Option<u32>,
        name: String,
    },
    /// Write a named byte stream to stdout.
    Restorebits { name: String },
    /// Print backup and stream names, grouped by kind.
    List,
    /// Integrity-check every named root and the blob store itself.
    Fsck,
}

/// Either a usage mistake (exits 1, §7 UserError-at-the-CLI-boundary) or an
/// error the `Repository` layer raised (exits the logged error count).
enum DispatchError {
    Arg(String),
    Bk(BkError),
}

impl From<BkError> for DispatchError {
    fn from(e: BkError) -> Self {
        DispatchError::Bk(e)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let verbosity = if args.debug {
        Verbosity::Debug
    } else if args.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Default
    };
    let logger = Logger::init(verbosity);
    let before = args.profile.then(ResourceSnapshot::capture);

    let overrides = ConfigOverrides {
        split_bits: subcommand_split_bits(&args.command),
        verbose: args.verbose,
        debug: args.debug,
        profile: args.profile,
    };

    let exit_code = match run(args.command, overrides, &logger) {
        Ok(()) => logger.exit_code(),
        Err(DispatchError::Arg(message)) => {
            eprintln!("bk: {message}");
            1
        }
        Err(DispatchError::Bk(e)) => {
            logger.error(&e);
            logger.exit_code().max(1)
        }
    };

    if args.profile {
        if let Some(before) = before {
            before.log_delta(&ResourceSnapshot::capture(), "session");
        }
    }

    ExitCode::from(exit_code)
}

fn subcommand_split_bits(command: &Commands) -> Option<u32> {
    match command {
        Commands::Backup { split_bits, .. } => *split_bits,
        Commands::Savebits { split_bits, .. } => *split_bits,
        _ => None,
    }
}

fn run(command: Commands, overrides: ConfigOverrides, logger: &Logger) -> Result<(), DispatchError> {
    let config = Config::resolve(overrides)?;

    match command {
        Commands::Init { encrypt } => {
            Repository::init(&config, encrypt)?;
            log::info!("initialized repository at {}", describe_target(&config));
            Ok(())
        }
        Commands::Backup { base, split_bits, name, dir } => {
            if !dir.is_dir() {
                return Err(DispatchError::Arg(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
            let repo = open_repo(&config)?;
            let cancel = install_cancel_handler();
            let key = repo.backup(&name, &dir, base.as_deref(), split_bits, &cancel)?;
            log::info!("created {key}");
            println!("{key}");
            Ok(())
        }
        Commands::Restore { name, dir } => {
            let repo = open_repo(&config)?;
            repo.restore(&name, &dir)?;
            log::info!("restored {name} into {}", dir.display());
            Ok(())
        }
        Commands::Savebits { split_bits, name } => {
            let repo = open_repo(&config)?;
            let cancel = install_cancel_handler();
            let stdin = io::stdin();
            let key = repo.savebits(&name, stdin.lock(), split_bits, &cancel)?;
            log::info!("created {key}");
            println!("{key}");
            Ok(())
        }
        Commands::Restorebits { name } => {
            let repo = open_repo(&config)?;
            let stdout = io::stdout();
            repo.restorebits(&name, stdout.lock())?;
            Ok(())
        }
        Commands::List => {
            let repo = open_repo(&config)?;
            let (backups, streams) = repo.list()?;
            println!("backups:");
            for b in backups {
                println!("  {b}");
            }
            println!("streams:");
            for s in streams {
                println!("  {s}");
            }
            Ok(())
        }
        Commands::Fsck => {
            let repo = open_repo(&config)?;
            let problems = repo.fsck()?;
            if problems.is_empty() {
                log::info!("fsck: clean");
            } else {
                for problem in &problems {
                    logger.error(problem);
                }
            }
            Ok(())
        }
    }
}

fn open_repo(config: &Config) -> Result<Repository, DispatchError> {
    Ok(Repository::open(config)?)
}

fn describe_target(config: &Config) -> String {
    match &config.store {
        StoreTarget::LocalDir(p) => p.display().to_string(),
        StoreTarget::ObjectStore { bucket_url, .. } => bucket_url.clone(),
    }
}

/// Registers a SIGINT handler that trips a `CancelFlag`, checked between
/// chunks during `backup`/`savebits` so ^C aborts the session cleanly
/// (§5 cancellation) instead of leaving a half-written name.
fn install_cancel_handler() -> CancelFlag {
    let cancel = CancelFlag::new();
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.raw()) {
        log::warn!("could not install SIGINT handler: {e}");
    }
    cancel
}
