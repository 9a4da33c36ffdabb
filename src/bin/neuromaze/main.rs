//! Runs the maze, from a real treadmill or a simulated one.
//!
//! ```text
//! neuromaze --out-dir data/mouse7 run --port /dev/ttyACM0
//! neuromaze --out-dir /tmp/dry simulate --speed 15
//! neuromaze --out-dir data/mouse7 --headless 600 run --port /dev/ttyACM0
//! ```

use clap::Parser;
use neuromaze::{
    args::{CommandTask, MazeArgs},
    config::ControllerConfig,
    console::{headless_session, operator_console, port_selector},
    device_bridge::DeviceBridge,
    dummy_bridge::DummyBridge,
    geometry::StraightTrack,
    pacer::Pacer,
    recorder_client::RecorderClient,
    serial_bridge::{port_exists, SerialBridge},
    session::SessionController,
};

use log::{error, info, warn};
use std::{error::Error, fs::File, path::Path, process::ExitCode};

/// Where the log goes when the console owns the terminal and no file was given.
const DEFAULT_LOG_FILE: &str = "neuromaze.log";

fn main() -> ExitCode {
    let args = MazeArgs::parse();

    let log_file = match (&args.log_file, args.headless_secs, &args.command) {
        (Some(path), _, _) => Some(path.clone()),
        (None, None, CommandTask::Run(_) | CommandTask::Simulate(_)) => {
            Some(DEFAULT_LOG_FILE.into())
        }
        _ => None,
    };
    if let Err(e) = init_logging(log_file.as_deref()) {
        eprintln!("Could not open log file: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("neuromaze: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> std::io::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
    }
    builder.init();
    Ok(())
}

fn run(args: MazeArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => ControllerConfig::from_path(path)?,
        None => ControllerConfig::default(),
    };

    match args.command {
        CommandTask::DefaultConfig(cmd) => {
            ControllerConfig::default().to_path(&cmd.outfile)?;
            println!("Default settings written to {}", cmd.outfile.display());
            Ok(())
        }
        CommandTask::Run(cmd) => {
            let port = match cmd.port {
                Some(port) => {
                    if !port_exists(&port) {
                        warn!("{} is not connected yet, will keep trying", port.display());
                    }
                    port
                }
                None => match port_selector(SerialBridge::available_ports()?)? {
                    Some(port) => port,
                    None => return Ok(()),
                },
            };
            info!("Using treadmill on {}", port.display());
            let bridge = SerialBridge::open(port, &config.serial);
            drive(args.out_dir.as_deref(), args.headless_secs, config, bridge)
        }
        CommandTask::Simulate(sim) => {
            info!("Using a simulated treadmill at {} units/s", sim.speed);
            let bridge = DummyBridge::builder()
                .speed(sim.speed)
                .noise(sim.noise)
                .pause_chance(sim.pause_chance)
                .garbage_chance(sim.garbage_chance)
                .interval(config.tick_interval())
                .build();
            drive(args.out_dir.as_deref(), args.headless_secs, config, bridge)
        }
    }
}

fn drive<B: DeviceBridge>(
    out_dir: Option<&Path>,
    headless_secs: Option<f64>,
    config: ControllerConfig,
    bridge: B,
) -> Result<(), Box<dyn Error>> {
    let recorder = RecorderClient::new(config.recorder.clone());
    let geometry = StraightTrack::new(config.track.clone());
    let connect_timeout = config.recorder.connect_timeout();
    let mut pacer = Pacer::new(config.tick_interval());

    let mut controller = SessionController::new(config, bridge, recorder, geometry);
    if let Some(dir) = out_dir {
        controller.set_output_dir(dir);
    }

    match headless_secs {
        Some(secs) => headless_session(&mut controller, &mut pacer, secs, connect_timeout)?,
        None => {
            controller.connect_recorder();
            operator_console(&mut controller, &mut pacer)?;
        }
    }
    info!("Bye");
    Ok(())
}
