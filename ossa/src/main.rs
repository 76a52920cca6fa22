//! OSSA lowering CLI

use clap::{Parser, Subcommand};
use ossa::config::{EnforcementMode, LoweringConfig};
use ossa::interp::Interpreter;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ossa", version, about = "Ownership-SSA lowering of resolved declaration graphs")]
struct Cli {
    /// Log lowering progress (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lower a module and print its IR
    Lower {
        /// Resolved module (JSON)
        file: PathBuf,
        /// Configuration file (defaults to ossa.toml next to the module)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit every dynamic access as unchecked
        #[arg(long)]
        unchecked: bool,
        /// Front-end source the spans refer to, for diagnostics
        #[arg(long)]
        source: Option<PathBuf>,
        /// Print module statistics as JSON instead of the IR
        #[arg(long)]
        stats: bool,
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Lower and verify a module without printing it
    Verify {
        file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Interpret a nullary function of a lowered module
    Run {
        file: PathBuf,
        /// Function to call
        function: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Lower a module and match its IR against check directives
    Check {
        file: PathBuf,
        /// File holding the directives
        checks: PathBuf,
        /// Directive prefix
        #[arg(long, default_value = "CHECK")]
        prefix: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Lower {
            file,
            config,
            unchecked,
            source,
            stats,
            output,
        } => lower_file(&file, config.as_deref(), unchecked, source.as_deref(), stats, output.as_deref()),
        Command::Verify { file, config } => verify_file(&file, config.as_deref()),
        Command::Run { file, function, config } => run_function(&file, &function, config.as_deref()),
        Command::Check {
            file,
            checks,
            prefix,
            config,
        } => check_file(&file, &checks, &prefix, config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "ossa=debug",
        _ => "ossa=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(module: &Path, explicit: Option<&Path>) -> ossa::Result<LoweringConfig> {
    match explicit {
        Some(path) => LoweringConfig::load(path),
        None => LoweringConfig::discover(module.parent().unwrap_or_else(|| Path::new("."))),
    }
}

fn lower(file: &Path, config: &LoweringConfig) -> ossa::Result<ossa::MirModule> {
    let module = ossa::load_module(file)?;
    ossa::lower_module(&module, config)
}

fn lower_file(
    file: &Path,
    config: Option<&Path>,
    unchecked: bool,
    source: Option<&Path>,
    stats: bool,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(file, config)?;
    if unchecked {
        config.enforcement = EnforcementMode::Unchecked;
    }

    let mir = match lower(file, &config) {
        Ok(mir) => mir,
        Err(err) => {
            if let (Some(path), Some(_)) = (source, err.span()) {
                let text = std::fs::read_to_string(path)?;
                ossa::error::report_error(&path.display().to_string(), &text, &err);
            }
            return Err(err.into());
        }
    };

    let text = if stats {
        serde_json::to_string_pretty(&ossa::ModuleStats::of(&mir))?
    } else {
        ossa::format_module(&mir)
    };
    match output {
        Some(path) => std::fs::write(path, text)?,
        None => println!("{text}"),
    }
    Ok(())
}

fn verify_file(file: &Path, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(file, config)?;
    config.verify = true;
    let mir = lower(file, &config)?;
    println!("✓ {} verified ({} functions)", file.display(), mir.functions.len());
    Ok(())
}

fn run_function(file: &Path, function: &str, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(file, config)?;
    let mir = lower(file, &config)?;

    let mut interp = Interpreter::new(&mir);
    let value = interp.run(function)?;
    println!("{value}");

    let report = interp.leak_report();
    if report.is_clean() {
        println!("no leaks");
    } else {
        println!("{report}");
    }
    println!("{}", serde_json::to_string(&interp.stats())?);
    Ok(())
}

fn check_file(file: &Path, checks: &Path, prefix: &str, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(file, config)?;
    let mir = lower(file, &config)?;
    let directives = std::fs::read_to_string(checks)?;

    let checker = ossa::filecheck::FileCheck::with_prefix(&directives, prefix)?;
    checker.check(&ossa::format_module(&mir))?;
    println!("✓ {} directives matched", checker.directives().len());
    Ok(())
}
