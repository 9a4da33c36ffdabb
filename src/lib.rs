//! NeuroMaze is the host-side controller for a closed-loop behavioural
//! experiment. A subject runs on a treadmill whose firmware reports the
//! cumulative distance travelled over a serial line; the controller turns
//! that distance into a position along a virtual corridor, hands out rewards
//! through the treadmill's relay when the subject lingers at marked wall
//! tiles, flashes the end plate and flips a binary context every lap, tells a
//! remote recording system when to start recording, and saves a time series
//! of the distance travelled for every session.
//!
//! The [`session::SessionController`] ties it all together. It is driven by
//! a fixed-rate tick and talks to the outside world through three seams: a
//! [`device_bridge::DeviceBridge`] for the treadmill, a
//! [`recorder_client::RecorderControl`] for the recording system and a
//! [`geometry::TrackGeometry`] for the corridor.

#![warn(missing_docs)]
pub mod args;
pub mod config;
pub mod console;
pub mod device_bridge;
pub mod device_message;
pub mod dummy_bridge;
pub mod geometry;
pub mod pacer;
pub mod position_log;
pub mod recorder_client;
pub mod reward_gate;
pub mod scheduler;
pub mod serial_bridge;
pub mod session;
