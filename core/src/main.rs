use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use mpf::FilterConfig;
use mpf::sim::{ReplayRecord, run_replay};

const LONG_ABOUT: &str = "Modular Monte Carlo pose estimator.

Replays a recorded stream of initial poses, twists, GNSS fixes and reference heights through the particle \
filter on a simulated clock and writes the estimated pose track to CSV.

Input CSV columns: time,kind,x,y,z,yaw,speed,yaw_rate,position_variance,yaw_variance,speed_variance,\
yaw_rate_variance,quality. `kind` is one of init, gnss_init, twist, fix, height; `quality` is one of rtk_fixed, \
rtk_float, standalone. Columns not used by a row's kind may be left empty.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Modular Monte Carlo pose estimator.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Replay a recorded input file through the estimator
    Replay(ReplayArgs),
    /// Write the default configuration to a file (format chosen by extension)
    Config {
        /// Output path (.json, .yaml, .yml or .toml)
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Input CSV file with replay records
    #[arg(short, long)]
    input: PathBuf,
    /// Output CSV file for the estimated pose track
    #[arg(short, long)]
    output: PathBuf,
    /// Estimator configuration (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the random seed from the configuration
    #[arg(long)]
    seed: Option<u64>,
}

/// Open (and create the parent directory of) the log file in append mode.
fn open_log_file(log_path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(log_path)
}

/// Set up `env_logger` at `log_level`, writing to `log_file` when given and to stderr otherwise.
fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = match log_level.parse::<log::LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("Unknown log level '{log_level}', using 'info'");
            log::LevelFilter::Info
        }
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {}: {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(log_path) = log_file {
        let file = open_log_file(log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FilterConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(FilterConfig::from_file(path)?)
        }
        None => Ok(FilterConfig::default()),
    }
}

fn replay(args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    if !args.input.is_file() {
        return Err(format!("Input file '{}' does not exist.", args.input.display()).into());
    }
    let mut config = load_config(args.config.as_deref())?;
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;
    let records = ReplayRecord::from_csv(&args.input)?;
    info!("Read {} records from {}", records.len(), args.input.display());
    let result = run_replay(&records, &config)?;
    if let Some(last) = result.last_pose() {
        info!(
            "Final estimate at t = {:.3} s: x = {:.3} m, y = {:.3} m, yaw = {:.2} deg",
            last.time, last.x, last.y, last.yaw_deg
        );
    }
    result.to_csv(&args.output)?;
    info!("Wrote {} poses to {}", result.poses.len(), args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_deref())?;

    let outcome = match &cli.command {
        Command::Replay(args) => replay(args),
        Command::Config { output } => FilterConfig::default()
            .to_file(output)
            .map(|_| info!("Wrote default configuration to {}", output.display()))
            .map_err(|e| e.into()),
    };
    if let Err(e) = &outcome {
        error!("{e}");
    }
    outcome
}
