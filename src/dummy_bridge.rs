//! A simulated treadmill for dry runs without hardware.

use crate::device_bridge::{DeviceBridge, DeviceError, MessageQueue};
use crate::device_message::{DeviceCommand, SensorMessage};

use log::{debug, info};
use rand::prelude::*;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// A pretend treadmill. A worker thread plays a subject that walks at a
/// noisy speed and occasionally stops, emitting cumulative distances the same
/// way the real firmware does. Commands are honoured: `Reset` zeroes the
/// counter, the actuator commands are only logged.
pub struct DummyBridge {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    queue: MessageQueue,
}

enum Signal {
    Command(DeviceCommand),
    Stop,
}

/// Builds a [`DummyBridge`] with the given walking behaviour.
#[derive(Debug, Clone)]
pub struct DummyBridgeBuilder {
    speed: f64,
    noise: f64,
    pause_chance: f64,
    interval: Duration,
    garbage_chance: f64,
}

impl Default for DummyBridgeBuilder {
    fn default() -> Self {
        Self {
            speed: 10.0,
            noise: 2.0,
            pause_chance: 0.01,
            interval: Duration::from_millis(20),
            garbage_chance: 0.0,
        }
    }
}

impl DummyBridgeBuilder {
    /// Mean walking speed in distance units per second. Non-finite speeds
    /// stand the subject still.
    pub fn speed(self, speed: f64) -> Self {
        let speed = if speed.is_finite() { speed } else { 0.0 };
        Self { speed, ..self }
    }

    /// Spread of the per-step speed.
    pub fn noise(self, noise: f64) -> Self {
        let noise = if noise.is_finite() { noise.abs() } else { 0.0 };
        Self { noise, ..self }
    }

    /// Chance per step that the subject stands still for that step.
    pub fn pause_chance(self, pause_chance: f64) -> Self {
        Self {
            pause_chance: chance(pause_chance),
            ..self
        }
    }

    /// Chance per step of emitting a corrupted line instead of a distance.
    pub fn garbage_chance(self, garbage_chance: f64) -> Self {
        Self {
            garbage_chance: chance(garbage_chance),
            ..self
        }
    }

    /// Time between two emitted lines.
    pub fn interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    /// Start the worker thread.
    pub fn build(self) -> DummyBridge {
        let (tx, rx) = mpsc::channel::<Signal>();
        let queue = MessageQueue::new(1);
        let th_queue = queue.clone();

        let handle = thread::spawn(move || {
            let mut rng = thread_rng();
            let speed = self.speed;
            let mut distance = 0.0_f64;
            let dt = self.interval.as_secs_f64();

            th_queue.push(SensorMessage::DeviceConnected);
            loop {
                while let Ok(received) = rx.try_recv() {
                    match received {
                        Signal::Command(DeviceCommand::Reset) => distance = 0.0,
                        Signal::Command(command) => info!("Dummy treadmill got {}", command),
                        Signal::Stop => {
                            th_queue.push(SensorMessage::DeviceDisconnected);
                            return;
                        }
                    }
                }

                if !rng.gen_bool(self.pause_chance) {
                    let jitter = if self.noise > 0.0 {
                        rng.gen_range(-self.noise..self.noise)
                    } else {
                        0.0
                    };
                    distance += ((speed + jitter) * dt).max(0.0);
                }

                if rng.gen_bool(self.garbage_chance) {
                    th_queue.push(SensorMessage::from_line("#%!"));
                } else {
                    th_queue.push(SensorMessage::from_line(&format!("{:.3}", distance)));
                }
                thread::sleep(self.interval);
            }
        });

        DummyBridge {
            handle: Some(handle),
            tx,
            queue,
        }
    }
}

// A probability `gen_bool` accepts; NaN means never.
fn chance(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

impl DummyBridge {
    /// Start configuring a dummy treadmill.
    pub fn builder() -> DummyBridgeBuilder {
        DummyBridgeBuilder::default()
    }

    /// Stop the worker and wait for it.
    pub fn stop(&mut self) {
        if self.tx.send(Signal::Stop).is_ok() {
            if let Some(thread) = self.handle.take() {
                let _ = thread.join();
            }
        }
    }
}

impl DeviceBridge for DummyBridge {
    fn read_message(&mut self) -> Option<SensorMessage> {
        self.queue.pop()
    }

    fn send(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
        debug!("Sending {} to dummy treadmill", command);
        self.tx
            .send(Signal::Command(command))
            .map_err(|_| DeviceError::WorkerGone)
    }
}

impl Drop for DummyBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
