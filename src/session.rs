//! The session controller: the one place where sensor input, the track, the
//! reward gate and the recorder meet.
//!
//! The controller is driven by [`SessionController::tick`], called at a fixed
//! cadence with the current time on a monotonic clock in seconds. Nothing in
//! here blocks: the end plate flash and the reward relay pulse are queued on a
//! [`Scheduler`] and played out by later ticks.
//!
//! The treadmill counts distance monotonically whether or not the subject is
//! allowed to move in the maze, so the controller keeps two distances: the
//! raw count as last reported by the device, and the cyclic distance that
//! actually places the subject on the track. Only positive raw increments
//! seen while translation is enabled move the cyclic distance.

use crate::config::ControllerConfig;
use crate::device_bridge::DeviceBridge;
use crate::device_message::{DeviceCommand, SensorMessage};
use crate::geometry::{Position, TrackGeometry};
use crate::position_log::{self, DistanceSample, PositionLogError};
use crate::recorder_client::{RecorderControl, RecorderError, RecorderEvent};
use crate::reward_gate::{RewardGate, Side, TriggerReward};
use crate::scheduler::Scheduler;

use log::{debug, error, info, warn};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// What the controller is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing moves and nothing is recorded.
    Idle,
    /// A recorded session: movement is translated and samples are kept.
    Running,
    /// A dry run: movement is translated but nothing is kept.
    TestRun,
}

/// The two looks of the end plate while it flashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateShade {
    /// White.
    Light,
    /// Black.
    Dark,
}

/// Things that happened during a tick, for the presentation layer and logs.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The recorder link came up.
    RecorderConnected,
    /// The recorder link failed; sessions cannot start until it reconnects.
    RecorderFailed,
    /// The treadmill (re)appeared.
    DeviceConnected,
    /// The treadmill went away.
    DeviceDisconnected,
    /// A line from the treadmill was not a distance; the last one was kept.
    MalformedReading(String),
    /// A command could not be written to the treadmill.
    DeviceWriteFailed(DeviceCommand),
    /// A reward was earned and the relay closed.
    RewardTriggered(TriggerReward),
    /// The end plate changed shade.
    PlateShade(PlateShade),
    /// The subject reached the end plate; `context` is the new context value.
    LapCompleted {
        /// Binary context value for the coming lap.
        context: u8,
    },
    /// The flash finished and the subject is back at the start.
    FlashFinished,
}

/// Why a session could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    /// The last attempt to reach the recorder failed.
    RecorderFailed,
    /// No output directory was chosen.
    NoOutputDestination,
    /// A session or test run is already going.
    AlreadyActive(SessionState),
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardViolation::RecorderFailed => {
                write!(f, "recorder connection failed, reconnect before starting")
            }
            GuardViolation::NoOutputDestination => {
                write!(f, "choose an output directory before starting")
            }
            GuardViolation::AlreadyActive(state) => write!(f, "already in {:?}", state),
        }
    }
}

/// Errors from session transitions.
#[derive(Debug)]
pub enum SessionError {
    /// The transition was refused; nothing changed.
    Guard(GuardViolation),
    /// The session ended but its samples could not be written. They are
    /// kept for [`SessionController::retry_flush`].
    Persist(PositionLogError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Guard(violation) => write!(f, "{}", violation),
            SessionError::Persist(error) => write!(f, "could not save positions: {}", error),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<GuardViolation> for SessionError {
    fn from(value: GuardViolation) -> Self {
        Self::Guard(value)
    }
}

impl From<PositionLogError> for SessionError {
    fn from(value: PositionLogError) -> Self {
        Self::Persist(value)
    }
}

/// Work queued for a later tick.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Deferred {
    ActuatorOff,
    Shade(PlateShade),
    FlashComplete,
}

impl Deferred {
    fn is_flash(&self) -> bool {
        matches!(self, Deferred::Shade(_) | Deferred::FlashComplete)
    }
}

/// Owns the session state machine and everything it drives.
pub struct SessionController<B, R, G>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    config: ControllerConfig,
    bridge: B,
    recorder: R,
    geometry: G,
    gate: RewardGate,
    scheduler: Scheduler<Deferred>,

    state: SessionState,
    collecting: bool,
    translating: bool,
    recording: bool,

    raw_distance: f64,
    last_raw_distance: f64,
    cyclic_distance: f64,
    position: Position,

    flash_in_progress: bool,
    shade: PlateShade,
    context: u8,
    actuator_engaged: bool,

    started_at: f64,
    samples: Vec<DistanceSample>,
    unflushed: Vec<DistanceSample>,
    // Write failures not yet returned by a tick.
    pending: Vec<ControllerEvent>,
    output_dir: Option<PathBuf>,
}

impl<B, R, G> SessionController<B, R, G>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    /// An idle controller with the subject at the start of the track.
    pub fn new(config: ControllerConfig, bridge: B, recorder: R, geometry: G) -> Self {
        let gate = RewardGate::from_config(&config);
        let position = geometry.position_at_distance(0.0);
        Self {
            config,
            bridge,
            recorder,
            geometry,
            gate,
            scheduler: Scheduler::new(),
            state: SessionState::Idle,
            collecting: false,
            translating: false,
            recording: false,
            raw_distance: 0.0,
            last_raw_distance: 0.0,
            cyclic_distance: 0.0,
            position,
            flash_in_progress: false,
            shade: PlateShade::Dark,
            context: 0,
            actuator_engaged: false,
            started_at: 0.0,
            samples: Vec::new(),
            unflushed: Vec::new(),
            pending: Vec::new(),
            output_dir: None,
        }
    }

    /// Choose where `position.txt` goes. Required before [`Self::start`].
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        info!("Positions will be saved to {}", position_log::position_file(&dir).display());
        self.output_dir = Some(dir);
    }

    /// The chosen output directory, if any.
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Start a recorded session at time `now`.
    pub fn start(&mut self, now: f64) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(GuardViolation::AlreadyActive(self.state).into());
        }
        if self.recorder.last_attempt_failed() {
            warn!("Session not started: {}", GuardViolation::RecorderFailed);
            return Err(GuardViolation::RecorderFailed.into());
        }
        if self.output_dir.is_none() {
            warn!("Session not started: {}", GuardViolation::NoOutputDestination);
            return Err(GuardViolation::NoOutputDestination.into());
        }

        match self.recorder.send_commands() {
            Ok(()) => info!("Recorder told to record"),
            Err(RecorderError::NotConnected) => {
                warn!("Recorder not connected, the session will not be recorded remotely")
            }
            Err(error) => warn!("Could not command the recorder: {}", error),
        }

        self.cyclic_distance = 0.0;
        self.reset_device();
        self.collecting = true;
        self.translating = true;
        self.recording = true;
        self.started_at = now;
        self.samples.clear();
        self.state = SessionState::Running;
        info!("Session started at {:.3}", now);
        Ok(())
    }

    /// End the recorded session and save its samples. Returns `Ok(false)` if
    /// nothing was being recorded.
    pub fn conclude(&mut self) -> Result<bool, SessionError> {
        if !self.recording {
            debug!("Conclude ignored, not recording");
            return Ok(false);
        }

        self.recording = false;
        self.stop_moving();
        self.state = SessionState::Idle;
        let samples = std::mem::take(&mut self.samples);
        info!("Session concluded with {} samples", samples.len());

        self.unflushed.extend(samples);
        self.retry_flush()?;
        Ok(true)
    }

    /// Start or stop a test run. Returns the state after the toggle.
    pub fn toggle_test(&mut self) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Idle => {
                self.cyclic_distance = 0.0;
                self.reset_device();
                self.collecting = true;
                self.translating = true;
                self.recording = false;
                self.state = SessionState::TestRun;
                info!("Test run started (no data collected)");
            }
            SessionState::TestRun => {
                self.stop_moving();
                self.state = SessionState::Idle;
                info!("Test run stopped");
            }
            SessionState::Running => {
                return Err(GuardViolation::AlreadyActive(self.state).into());
            }
        }
        Ok(self.state)
    }

    /// Write out samples left over from a failed save. Returns how many were
    /// written.
    pub fn retry_flush(&mut self) -> Result<usize, SessionError> {
        if self.unflushed.is_empty() {
            return Ok(0);
        }
        let dir = self
            .output_dir
            .as_ref()
            .ok_or(GuardViolation::NoOutputDestination)?;
        let path = position_log::position_file(dir);

        info!("Writing position data to {}...", path.display());
        match position_log::append_to_path(&path, &self.unflushed) {
            Ok(()) => {
                let written = self.unflushed.len();
                self.unflushed.clear();
                info!("Writing complete!");
                Ok(written)
            }
            Err(error) => {
                error!("Could not write {}: {}", path.display(), error);
                Err(error.into())
            }
        }
    }

    /// Advance the controller to time `now`.
    pub fn tick(&mut self, now: f64) -> Vec<ControllerEvent> {
        let mut events = std::mem::take(&mut self.pending);

        for event in self.recorder.poll() {
            events.push(match event {
                RecorderEvent::Connected => ControllerEvent::RecorderConnected,
                RecorderEvent::Failed => ControllerEvent::RecorderFailed,
            });
        }

        if let Some(msg) = self.bridge.read_message() {
            self.handle_message(msg, &mut events);
        }

        for action in self.scheduler.take_due(now) {
            self.run_deferred(action, &mut events);
        }

        if self.translating {
            self.advance(now, &mut events);
        }

        self.check_lap_boundary(now, &mut events);

        if self.recording {
            self.samples
                .push(DistanceSample::new(now - self.started_at, self.cyclic_distance));
        }

        events.append(&mut self.pending);
        events
    }

    /// Ask for a new recorder connection attempt.
    pub fn connect_recorder(&mut self) -> bool {
        self.recorder.connect()
    }

    /// Zero the treadmill's counter and the raw baseline.
    pub fn reset_device(&mut self) {
        self.send(DeviceCommand::Reset);
        self.raw_distance = 0.0;
        self.last_raw_distance = 0.0;
    }

    /// Close the reward relay by hand.
    pub fn actuator_on(&mut self) {
        self.send(DeviceCommand::ActuatorOn);
    }

    /// Open the reward relay by hand.
    pub fn actuator_off(&mut self) {
        self.send(DeviceCommand::ActuatorOff);
    }

    /// Turn reward mode on or off.
    pub fn set_reward_mode(&mut self, enabled: bool) {
        info!("Reward mode {}", if enabled { "on" } else { "off" });
        self.gate.set_enabled(enabled);
    }

    /// Mark a wall tile as a reward tile or a plain one.
    pub fn set_reward_tile(&mut self, side: Side, index: usize, reward: bool) -> bool {
        self.gate.set_reward_tile(side, index, reward)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// How far along the track the subject is.
    pub fn cyclic_distance(&self) -> f64 {
        self.cyclic_distance
    }

    /// The last distance the treadmill reported.
    pub fn raw_distance(&self) -> f64 {
        self.raw_distance
    }

    /// Where the subject is.
    pub fn position(&self) -> Position {
        self.position
    }

    /// The alternating context value, flipped at every lap.
    pub fn context(&self) -> u8 {
        self.context
    }

    /// Current look of the end plate.
    pub fn plate_shade(&self) -> PlateShade {
        self.shade
    }

    /// True from reaching the end plate until the subject is far from it again.
    pub fn flash_in_progress(&self) -> bool {
        self.flash_in_progress
    }

    /// True while treadmill movement moves the subject.
    pub fn is_translating(&self) -> bool {
        self.translating
    }

    /// True while samples are being kept.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// True while the reward relay was last told to close.
    pub fn actuator_engaged(&self) -> bool {
        self.actuator_engaged
    }

    /// Samples of the current session.
    pub fn samples(&self) -> &[DistanceSample] {
        &self.samples
    }

    /// Samples of a finished session that still have to be saved.
    pub fn unflushed(&self) -> &[DistanceSample] {
        &self.unflushed
    }

    /// The reward bookkeeping.
    pub fn gate(&self) -> &RewardGate {
        &self.gate
    }

    /// The recorder link.
    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// The recorder link, mutably.
    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }

    /// The device bridge.
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// The device bridge, mutably.
    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    /// Shared tail of conclude and stopping a test run.
    fn stop_moving(&mut self) {
        self.translating = false;
        self.gate.clear_timers();
        self.collecting = false;
        self.cyclic_distance = 0.0;
        self.reset_device();
        self.position = self.geometry.position_at_distance(0.0);

        let cancelled = self.scheduler.cancel_where(Deferred::is_flash);
        if cancelled > 0 {
            debug!("Cancelled {} pending flash steps", cancelled);
        }
        self.flash_in_progress = false;
    }

    /// Failures are logged and reported as [`ControllerEvent::DeviceWriteFailed`]
    /// by the current or next tick.
    fn send(&mut self, command: DeviceCommand) {
        match self.bridge.send(command) {
            Ok(()) => {
                match command {
                    DeviceCommand::ActuatorOn => self.actuator_engaged = true,
                    DeviceCommand::ActuatorOff => self.actuator_engaged = false,
                    DeviceCommand::Reset => debug!("Reset sent"),
                }
            }
            Err(error) => {
                warn!("Could not send {}: {}", command, error);
                self.pending.push(ControllerEvent::DeviceWriteFailed(command));
            }
        }
    }

    fn handle_message(&mut self, msg: SensorMessage, events: &mut Vec<ControllerEvent>) {
        match msg {
            SensorMessage::DeviceConnected => {
                info!("Treadmill connected");
                events.push(ControllerEvent::DeviceConnected);
                self.reset_device();
            }
            SensorMessage::DeviceDisconnected => {
                warn!("Treadmill connection attempt failed or disconnection detected");
                events.push(ControllerEvent::DeviceDisconnected);
            }
            SensorMessage::Reading(distance) => {
                if self.collecting {
                    self.raw_distance = distance;
                }
            }
            SensorMessage::Malformed(raw) => {
                if self.collecting {
                    warn!("Read error: {:?}, keeping {}", raw, self.raw_distance);
                }
                events.push(ControllerEvent::MalformedReading(raw));
            }
        }
    }

    fn run_deferred(&mut self, action: Deferred, events: &mut Vec<ControllerEvent>) {
        match action {
            Deferred::ActuatorOff => {
                self.send(DeviceCommand::ActuatorOff);
            }
            Deferred::Shade(shade) => {
                self.shade = shade;
                events.push(ControllerEvent::PlateShade(shade));
            }
            Deferred::FlashComplete => {
                self.cyclic_distance = 0.0;
                self.last_raw_distance = self.raw_distance;
                self.translating = self.state != SessionState::Idle;
                info!("Flash complete, back to the start");
                events.push(ControllerEvent::FlashFinished);
            }
        }
    }

    fn advance(&mut self, now: f64, events: &mut Vec<ControllerEvent>) {
        let delta = self.raw_distance - self.last_raw_distance;
        if delta > 0.0 {
            self.cyclic_distance += delta * self.config.damping;
        }
        self.position = self.geometry.position_at_distance(self.cyclic_distance);
        self.last_raw_distance = self.raw_distance;

        if self.gate.is_enabled() {
            self.evaluate_rewards(now, events);
        }
    }

    fn evaluate_rewards(&mut self, now: f64, events: &mut Vec<ControllerEvent>) {
        for side in Side::ALL {
            let tiles: Vec<(usize, f64)> = self
                .gate
                .reward_tiles(side)
                .filter_map(|i| {
                    self.geometry
                        .reward_tile_position(side, i)
                        .map(|p| (i, p.distance(&self.position)))
                })
                .collect();

            if let Some(trigger) = self.gate.evaluate_side(side, tiles, now) {
                events.push(ControllerEvent::RewardTriggered(trigger));
                self.send(DeviceCommand::ActuatorOn);
                self.scheduler
                    .schedule(now + self.config.reward_pulse_secs, Deferred::ActuatorOff);
            }
        }
    }

    fn check_lap_boundary(&mut self, now: f64, events: &mut Vec<ControllerEvent>) {
        let to_end = self
            .position
            .distance(&self.geometry.terminal_position());

        if to_end < self.config.lap_near_threshold && !self.flash_in_progress {
            self.translating = false;
            self.gate.clear_timers();
            self.flash_in_progress = true;
            self.schedule_flash(now);
            self.context ^= 1;
            self.gate.reset_lap();
            info!("Lap complete, context is now {}", self.context);
            events.push(ControllerEvent::LapCompleted {
                context: self.context,
            });
        } else if to_end > self.config.lap_far_threshold {
            self.flash_in_progress = false;
        }
    }

    fn schedule_flash(&mut self, now: f64) {
        let period = self.config.flash_period_secs;
        for cycle in 0..self.config.flash_cycles {
            let at = now + cycle as f64 * period;
            self.scheduler.schedule(at, Deferred::Shade(PlateShade::Light));
            self.scheduler
                .schedule(at + period / 2.0, Deferred::Shade(PlateShade::Dark));
        }
        self.scheduler.schedule(
            now + self.config.flash_cycles as f64 * period,
            Deferred::FlashComplete,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_bridge::DeviceError;
    use crate::config::TrackConfig;
    use crate::geometry::StraightTrack;
    use crate::recorder_client::ConnectionState;
    use std::collections::VecDeque;

    const TICK: f64 = 0.02;

    #[derive(Default)]
    struct FakeBridge {
        inbox: VecDeque<SensorMessage>,
        sent: Vec<DeviceCommand>,
        broken: bool,
    }

    impl DeviceBridge for FakeBridge {
        fn read_message(&mut self) -> Option<SensorMessage> {
            self.inbox.pop_front()
        }

        fn send(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
            if self.broken {
                return Err(DeviceError::NotConnected);
            }
            self.sent.push(command);
            Ok(())
        }
    }

    struct FakeRecorder {
        state: ConnectionState,
        failed: bool,
        pending: Vec<RecorderEvent>,
        commands_sent: usize,
    }

    impl FakeRecorder {
        fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                failed: false,
                pending: Vec::new(),
                commands_sent: 0,
            }
        }
    }

    impl RecorderControl for FakeRecorder {
        fn connect(&mut self) -> bool {
            self.state = ConnectionState::Connecting;
            true
        }

        fn poll(&mut self) -> Vec<RecorderEvent> {
            for event in &self.pending {
                match event {
                    RecorderEvent::Connected => {
                        self.state = ConnectionState::Connected;
                        self.failed = false;
                    }
                    RecorderEvent::Failed => {
                        self.state = ConnectionState::Failed;
                        self.failed = true;
                    }
                }
            }
            std::mem::take(&mut self.pending)
        }

        fn state(&self) -> ConnectionState {
            self.state
        }

        fn last_attempt_failed(&self) -> bool {
            self.failed
        }

        fn acquisition_misconfigured(&self) -> bool {
            false
        }

        fn clear_misconfigured(&mut self) {}

        fn send_commands(&mut self) -> Result<(), RecorderError> {
            if self.state != ConnectionState::Connected {
                return Err(RecorderError::NotConnected);
            }
            self.commands_sent += 1;
            Ok(())
        }
    }

    type Controller = SessionController<FakeBridge, FakeRecorder, StraightTrack>;

    fn controller() -> Controller {
        controller_on(TrackConfig::default())
    }

    fn controller_on(track: TrackConfig) -> Controller {
        SessionController::new(
            ControllerConfig::default(),
            FakeBridge::default(),
            FakeRecorder::new(),
            StraightTrack::new(track),
        )
    }

    fn feed(c: &mut Controller, line: &str) {
        c.bridge_mut().inbox.push_back(SensorMessage::from_line(line));
    }

    /// Feeds one line per tick and returns the cyclic distance after each.
    fn run_lines(c: &mut Controller, lines: &[&str], start: f64) -> Vec<f64> {
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                feed(c, line);
                c.tick(start + i as f64 * TICK);
                c.cyclic_distance()
            })
            .collect()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn increments_are_damped() {
        let mut c = controller();
        c.toggle_test().unwrap();
        let cyclic = run_lines(&mut c, &["0", "5", "5", "10"], 0.0);
        assert_close(&cyclic, &[0.0, 4.0, 4.0, 8.0]);
    }

    #[test]
    fn malformed_readings_keep_the_last_distance() {
        let mut c = controller();
        c.toggle_test().unwrap();
        let cyclic = run_lines(&mut c, &["1.0", "garbage", "2.0"], 0.0);
        assert_close(&cyclic, &[0.8, 0.8, 1.6]);
    }

    #[test]
    fn idle_controller_never_moves() {
        let mut c = controller();
        let cyclic = run_lines(&mut c, &["1", "2", "30", "400"], 0.0);
        assert_close(&cyclic, &[0.0; 4]);
        assert_eq!(c.position(), Position::default());
    }

    #[test]
    fn backwards_readings_do_not_move_the_subject_back() {
        let mut c = controller();
        c.toggle_test().unwrap();
        let cyclic = run_lines(&mut c, &["10", "4", "5"], 0.0);
        assert_close(&cyclic, &[8.0, 8.0, 8.8]);
    }

    #[test]
    fn start_needs_an_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();

        assert!(matches!(
            c.start(0.0),
            Err(SessionError::Guard(GuardViolation::NoOutputDestination))
        ));
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.bridge().sent.is_empty());

        c.set_output_dir(dir.path());
        c.recorder_mut().pending.push(RecorderEvent::Connected);
        let events = c.tick(0.0);
        assert_eq!(events, vec![ControllerEvent::RecorderConnected]);

        c.start(0.1).unwrap();
        assert_eq!(c.state(), SessionState::Running);
        assert_eq!(c.bridge().sent, vec![DeviceCommand::Reset]);
        assert_eq!(c.recorder().commands_sent, 1);
    }

    #[test]
    fn start_is_refused_after_a_recorder_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.recorder_mut().pending.push(RecorderEvent::Failed);
        assert_eq!(c.tick(0.0), vec![ControllerEvent::RecorderFailed]);

        assert!(matches!(
            c.start(0.0),
            Err(SessionError::Guard(GuardViolation::RecorderFailed))
        ));
        assert!(c.bridge().sent.is_empty());

        c.recorder_mut().pending.push(RecorderEvent::Connected);
        c.tick(0.1);
        assert!(c.start(0.2).is_ok());
    }

    #[test]
    fn start_without_a_recorder_connection_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.start(0.0).unwrap();
        assert_eq!(c.recorder().commands_sent, 0);
        assert!(c.is_recording());
    }

    #[test]
    fn sessions_and_test_runs_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.start(0.0).unwrap();
        assert!(matches!(
            c.toggle_test(),
            Err(SessionError::Guard(GuardViolation::AlreadyActive(
                SessionState::Running
            )))
        ));
        c.conclude().unwrap();

        assert_eq!(c.toggle_test().unwrap(), SessionState::TestRun);
        assert!(matches!(
            c.start(1.0),
            Err(SessionError::Guard(GuardViolation::AlreadyActive(
                SessionState::TestRun
            )))
        ));
        assert_eq!(c.toggle_test().unwrap(), SessionState::Idle);
    }

    #[test]
    fn conclude_saves_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.start(10.0).unwrap();
        run_lines(&mut c, &["0", "1", "2", "3", "4"], 10.0);
        assert_eq!(c.samples().len(), 5);

        assert!(c.conclude().unwrap());
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.samples().is_empty());
        assert_eq!(c.cyclic_distance(), 0.0);
        assert_eq!(c.position(), Position::default());
        assert_eq!(
            c.bridge().sent,
            vec![DeviceCommand::Reset, DeviceCommand::Reset]
        );

        let blocks = position_log::read_from_path(position_log::position_file(dir.path())).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 5);
        assert!((blocks[0][4].elapsed_secs - 4.0 * TICK).abs() < 1e-9);
        assert!((blocks[0][4].cyclic_distance - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_runs_record_nothing() {
        let mut c = controller();
        c.toggle_test().unwrap();
        run_lines(&mut c, &["1", "2"], 0.0);
        assert!(c.samples().is_empty());
        assert!(!c.conclude().unwrap());
        assert_eq!(c.state(), SessionState::TestRun);
    }

    #[test]
    fn conclude_without_a_session_does_nothing() {
        let mut c = controller();
        assert!(!c.conclude().unwrap());
        assert!(c.bridge().sent.is_empty());
    }

    #[test]
    fn failed_saves_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path().join("missing"));
        c.start(0.0).unwrap();
        run_lines(&mut c, &["1", "2", "3"], 0.0);

        assert!(matches!(c.conclude(), Err(SessionError::Persist(_))));
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(c.unflushed().len(), 3);

        c.set_output_dir(dir.path());
        assert_eq!(c.retry_flush().unwrap(), 3);
        assert!(c.unflushed().is_empty());
        assert_eq!(c.retry_flush().unwrap(), 0);
    }

    /// Walks a test run to just before the end plate: 335 * 0.8 = 268.
    fn walk_to_end_plate(c: &mut Controller) -> Vec<ControllerEvent> {
        c.toggle_test().unwrap();
        feed(c, "335");
        c.tick(0.0)
    }

    #[test]
    fn reaching_the_end_plate_flashes_and_restarts() {
        let mut c = controller();
        let events = walk_to_end_plate(&mut c);
        assert_eq!(events, vec![ControllerEvent::LapCompleted { context: 1 }]);
        assert!(c.flash_in_progress());
        assert!(!c.is_translating());

        // The subject keeps walking during the flash; none of it counts.
        let mut all = Vec::new();
        let mut t = 0.0;
        let mut raw = 335.0;
        while t < 2.5 - 1e-9 {
            t += TICK;
            raw += 1.0;
            feed(&mut c, &raw.to_string());
            let events = c.tick(t);
            if !events.contains(&ControllerEvent::FlashFinished) {
                assert!((c.cyclic_distance() - 268.0).abs() < 1e-9);
            }
            all.extend(events);
        }
        while !all.contains(&ControllerEvent::FlashFinished) {
            t += TICK;
            all.extend(c.tick(t));
        }

        let shades: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::PlateShade(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(shades.len(), 10);
        assert_eq!(shades[0], PlateShade::Light);
        assert_eq!(shades[9], PlateShade::Dark);

        // Back at the start, far enough away to re-arm lap detection.
        assert_eq!(c.cyclic_distance(), 0.0);
        c.tick(t + TICK);
        assert!(c.is_translating());
        assert!(!c.flash_in_progress());
        assert_eq!(c.position(), Position::default());

        // Movement resumes from where the treadmill is now.
        raw += 5.0;
        feed(&mut c, &raw.to_string());
        c.tick(t + 2.0 * TICK);
        assert!((c.cyclic_distance() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn context_alternates_every_lap() {
        let mut c = controller();
        walk_to_end_plate(&mut c);
        assert_eq!(c.context(), 1);

        let mut t = 0.0;
        while c.flash_in_progress() {
            t += TICK;
            c.tick(t);
        }
        feed(&mut c, "670");
        let events = c.tick(t + TICK);
        assert_eq!(events, vec![ControllerEvent::LapCompleted { context: 0 }]);
    }

    #[test]
    fn stopping_mid_flash_cancels_it() {
        let mut c = controller();
        walk_to_end_plate(&mut c);
        c.tick(0.3);
        assert_eq!(c.toggle_test().unwrap(), SessionState::Idle);

        for i in 1..200 {
            let events = c.tick(0.3 + i as f64 * TICK);
            assert!(!events.contains(&ControllerEvent::FlashFinished));
        }
        assert!(!c.is_translating());
        assert!(!c.flash_in_progress());
    }

    fn reward_controller() -> Controller {
        let mut c = controller();
        // Left tile 0 sits at z = 12, 6 units off the centre line.
        c.set_reward_tile(Side::Left, 0, true);
        c.set_reward_mode(true);
        c.toggle_test().unwrap();
        c.bridge_mut().sent.clear();
        c
    }

    #[test]
    fn dwelling_at_a_reward_tile_pulses_the_relay_once() {
        let mut c = reward_controller();
        feed(&mut c, "15");

        let mut rewards = 0;
        for i in 0..20 {
            let events = c.tick(i as f64 * 0.5);
            rewards += events
                .iter()
                .filter(|e| matches!(e, ControllerEvent::RewardTriggered(_)))
                .count();
            if i == 4 {
                // Earned at t = 2.0, relay still closed.
                assert_eq!(c.bridge().sent, vec![DeviceCommand::ActuatorOn]);
                assert!(c.actuator_engaged());
            }
        }

        assert_eq!(rewards, 1);
        assert_eq!(
            c.bridge().sent,
            vec![DeviceCommand::ActuatorOn, DeviceCommand::ActuatorOff]
        );
        assert!(!c.actuator_engaged());
        assert!(!c.gate().is_armed(Side::Left, 0));
    }

    #[test]
    fn walking_past_a_reward_tile_pays_nothing() {
        let mut c = reward_controller();
        // Pass the tile at 0.8 units per tick, never lingering for 2 seconds.
        for i in 0..100 {
            feed(&mut c, &i.to_string());
            let events = c.tick(i as f64 * TICK);
            assert!(!events
                .iter()
                .any(|e| matches!(e, ControllerEvent::RewardTriggered(_))));
        }
        assert!(c.gate().is_armed(Side::Left, 0));
    }

    #[test]
    fn next_lap_re_arms_the_tiles() {
        let mut c = reward_controller();
        feed(&mut c, "15");
        for i in 0..6 {
            c.tick(i as f64 * 0.5);
        }
        assert!(!c.gate().is_armed(Side::Left, 0));

        feed(&mut c, "335");
        let events = c.tick(3.0);
        assert!(events.contains(&ControllerEvent::LapCompleted { context: 1 }));
        assert!(c.gate().is_armed(Side::Left, 0));
    }

    #[test]
    fn concluding_does_not_cut_a_pulse_short() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.set_reward_tile(Side::Left, 0, true);
        c.set_reward_mode(true);
        c.start(0.0).unwrap();
        feed(&mut c, "15");
        for i in 0..5 {
            c.tick(i as f64 * 0.5);
        }
        assert!(c.actuator_engaged());

        c.conclude().unwrap();
        c.tick(5.0);
        assert!(!c.actuator_engaged());
        assert_eq!(c.bridge().sent.last(), Some(&DeviceCommand::ActuatorOff));
    }

    #[test]
    fn device_reconnects_reset_the_counter() {
        let mut c = controller();
        c.bridge_mut().inbox.push_back(SensorMessage::DeviceConnected);
        assert_eq!(c.tick(0.0), vec![ControllerEvent::DeviceConnected]);
        assert_eq!(c.bridge().sent, vec![DeviceCommand::Reset]);

        c.bridge_mut().inbox.push_back(SensorMessage::DeviceDisconnected);
        assert_eq!(c.tick(0.1), vec![ControllerEvent::DeviceDisconnected]);
    }

    #[test]
    fn write_failures_are_reported_not_fatal() {
        let mut c = reward_controller();
        c.bridge_mut().broken = true;
        feed(&mut c, "15");
        let mut events = Vec::new();
        for i in 0..5 {
            events.extend(c.tick(i as f64 * 0.5));
        }
        assert!(events.contains(&ControllerEvent::DeviceWriteFailed(
            DeviceCommand::ActuatorOn
        )));
        assert!(!c.actuator_engaged());
        assert_eq!(c.state(), SessionState::TestRun);
    }

    /// Left tile 0 at z = 5, within reach of the start.
    fn tile_at_start() -> Controller {
        let mut c = controller_on(TrackConfig {
            first_tile_offset: 5.0,
            ..TrackConfig::default()
        });
        c.set_reward_tile(Side::Left, 0, true);
        c.set_reward_mode(true);
        c
    }

    #[test]
    fn dwell_does_not_carry_over_a_restart() {
        let mut c = tile_at_start();
        c.toggle_test().unwrap();
        assert!(c.tick(10.0).is_empty());
        assert_eq!(c.gate().dwell_started(Side::Left), Some(10.0));

        c.toggle_test().unwrap();
        assert_eq!(c.gate().dwell_started(Side::Left), None);
        c.toggle_test().unwrap();

        assert!(c.tick(100.0).is_empty());
        assert_eq!(c.gate().dwell_started(Side::Left), Some(100.0));
        assert!(c.tick(101.9).is_empty());
        assert_eq!(
            c.tick(102.0),
            vec![ControllerEvent::RewardTriggered(TriggerReward {
                side: Side::Left,
                tile: 0
            })]
        );
    }

    #[test]
    fn dwell_does_not_carry_over_the_flash() {
        // Tile 12 lands at z = 269, next to the end plate.
        let mut c = controller_on(TrackConfig {
            first_tile_offset: 5.0,
            tile_spacing: 22.0,
            ..TrackConfig::default()
        });
        c.set_reward_tile(Side::Left, 12, true);
        c.set_reward_mode(true);
        let events = walk_to_end_plate(&mut c);

        assert_eq!(events, vec![ControllerEvent::LapCompleted { context: 1 }]);
        assert_eq!(c.gate().dwell_started(Side::Left), None);
    }

    #[test]
    fn test_runs_ignore_recorder_failures() {
        let mut c = controller();
        c.recorder_mut().pending.push(RecorderEvent::Failed);
        c.tick(0.0);
        assert!(c.recorder().last_attempt_failed());

        assert_eq!(c.toggle_test().unwrap(), SessionState::TestRun);
        let cyclic = run_lines(&mut c, &["0", "5"], 0.1);
        assert_close(&cyclic, &[0.0, 4.0]);
    }

    #[test]
    fn failed_resets_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.bridge_mut().broken = true;

        c.start(0.0).unwrap();
        assert_eq!(
            c.tick(0.0),
            vec![ControllerEvent::DeviceWriteFailed(DeviceCommand::Reset)]
        );

        c.bridge_mut().inbox.push_back(SensorMessage::DeviceConnected);
        assert_eq!(
            c.tick(0.1),
            vec![
                ControllerEvent::DeviceConnected,
                ControllerEvent::DeviceWriteFailed(DeviceCommand::Reset)
            ]
        );
        assert!(c.tick(0.2).is_empty());
    }

    #[test]
    fn failed_manual_relay_commands_are_reported() {
        let mut c = controller();
        c.bridge_mut().broken = true;
        c.actuator_on();
        c.actuator_off();
        assert_eq!(
            c.tick(0.0),
            vec![
                ControllerEvent::DeviceWriteFailed(DeviceCommand::ActuatorOn),
                ControllerEvent::DeviceWriteFailed(DeviceCommand::ActuatorOff)
            ]
        );
    }
}
