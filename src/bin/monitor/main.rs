//! Prints whatever the treadmill sends, one classified message per line.
//! Handy for checking the wiring before running the maze.

use clap::Parser;
use neuromaze::{
    config::ControllerConfig,
    console::port_selector,
    device_bridge::DeviceBridge,
    device_message::{DeviceCommand, SensorMessage},
    serial_bridge::SerialBridge,
};

use log::{info, warn};
use std::{error::Error, path::PathBuf, thread::sleep, time::Duration};

#[derive(Debug, Parser)]
#[clap(version, about)]
struct MonitorArgs {
    /// Serial port of the treadmill; picked interactively if omitted
    #[arg(short = 'p', long = "port")]
    port: Option<PathBuf>,

    /// RON file with controller settings; only the serial section is used
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Zero the treadmill counter once connected
    #[arg(short = 'r', long = "reset")]
    reset: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = MonitorArgs::parse();

    let config = match &args.config {
        Some(path) => ControllerConfig::from_path(path)?,
        None => ControllerConfig::default(),
    };
    let port = match args.port {
        Some(port) => port,
        None => match port_selector(SerialBridge::available_ports()?)? {
            Some(port) => port,
            None => return Ok(()),
        },
    };

    // Monitoring wants every line, not just the freshest one.
    let mut serial = config.serial.clone();
    serial.max_unread_messages = 256;
    let mut bridge = SerialBridge::open(&port, &serial);
    println!("Listening on {}", port.display());

    loop {
        while let Some(msg) = bridge.read_message() {
            match msg {
                SensorMessage::DeviceConnected => {
                    println!("-- connected");
                    if args.reset {
                        match bridge.send(DeviceCommand::Reset) {
                            Ok(()) => info!("Counter reset"),
                            Err(e) => warn!("Could not reset: {}", e),
                        }
                    }
                }
                SensorMessage::DeviceDisconnected => println!("-- disconnected"),
                SensorMessage::Reading(distance) => println!("{:>12.3}", distance),
                SensorMessage::Malformed(raw) => println!("?? {:?}", raw),
            }
        }
        sleep(Duration::from_millis(20));
    }
}
