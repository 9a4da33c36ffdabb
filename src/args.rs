// Commandline argument parser using clap for NeuroMaze

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MazeArgs {
    #[command(subcommand, long_about)]
    /// Where treadmill readings come from
    pub command: CommandTask,

    /// RON file with controller settings; built-in defaults if absent
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory that receives position.txt
    #[arg(short = 'o', long = "out-dir", global = true)]
    pub out_dir: Option<PathBuf>,

    /// Write the log here instead of stderr. With the console showing, the log
    /// goes to neuromaze.log unless this is given
    #[arg(short = 'l', long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Skip the console and record a single session of this many seconds
    #[arg(long = "headless", global = true, value_parser = finite)]
    pub headless_secs: Option<f64>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Drive the maze from the treadmill on a serial port
    #[command(about)]
    Run(RunCommand),

    /// Drive the maze from a simulated treadmill
    #[command(about)]
    Simulate(SimulateCommand),

    /// Write the default settings to a RON file and exit
    #[command(about)]
    DefaultConfig(DefaultConfigCommand),
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct RunCommand {
    /// Serial port of the treadmill; picked interactively if omitted
    #[arg(short = 'p', long = "port")]
    pub port: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SimulateCommand {
    /// Mean walking speed, in distance units per second
    #[arg(short = 's', long = "speed", default_value_t = 10.0, value_parser = finite)]
    pub speed: f64,

    /// Spread of the walking speed
    #[arg(short = 'n', long = "noise", default_value_t = 2.0, value_parser = finite)]
    pub noise: f64,

    /// Chance per reading that the subject stands still
    #[arg(long = "pause-chance", default_value_t = 0.01, value_parser = probability)]
    pub pause_chance: f64,

    /// Chance per reading of a corrupted line
    #[arg(long = "garbage-chance", default_value_t = 0.0, value_parser = probability)]
    pub garbage_chance: f64,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct DefaultConfigCommand {
    /// File to write
    pub outfile: PathBuf,
}

fn finite(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(x) if x.is_finite() && x >= 0.0 => Ok(x),
        Ok(_) => Err(format!("{} is not a finite, non-negative number", s)),
        Err(e) => Err(e.to_string()),
    }
}

fn probability(s: &str) -> Result<f64, String> {
    match finite(s)? {
        p if p <= 1.0 => Ok(p),
        _ => Err(format!("{} is not between 0 and 1", s)),
    }
}
