//! The operator's screen: session status, reward tiles, recent events and the
//! keys that drive the controller.

use std::{collections::VecDeque, io::stdout, time::Duration};

use crate::{
    console::error::ConsoleError,
    device_bridge::DeviceBridge,
    geometry::TrackGeometry,
    pacer::Pacer,
    recorder_client::{ConnectionState, RecorderControl},
    reward_gate::{Side, TILES_PER_SIDE},
    session::{ControllerEvent, PlateShade, SessionController, SessionError, SessionState},
};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::{error, info, warn};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

const LOG_LINES: usize = 200;
const REDRAW_EVERY: u64 = 5;

/// Everything the operator can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Start a recorded session.
    Start,
    /// End the recorded session and save it.
    Conclude,
    /// Start or stop a test run.
    ToggleTest,
    /// Try the recorder again.
    ReconnectRecorder,
    /// Reward mode on/off.
    ToggleRewardMode,
    /// Close the reward relay.
    ActuatorOn,
    /// Open the reward relay.
    ActuatorOff,
    /// Zero the treadmill counter.
    ResetDevice,
    /// Save samples left over from a failed save.
    RetryFlush,
    /// Move the tile cursor to the other wall.
    SwitchSide,
    /// Move the tile cursor towards the start.
    PreviousTile,
    /// Move the tile cursor towards the end plate.
    NextTile,
    /// Make the tile under the cursor a reward tile, or not.
    ToggleTile,
    /// Leave, saving any running session first.
    Quit,
}

/// Key bindings.
pub fn command_for(key: KeyCode) -> Option<OperatorCommand> {
    use OperatorCommand as OC;
    let command = match key {
        KeyCode::Char('s') => OC::Start,
        KeyCode::Char('c') => OC::Conclude,
        KeyCode::Char('t') => OC::ToggleTest,
        KeyCode::Char('r') => OC::ReconnectRecorder,
        KeyCode::Char('w') => OC::ToggleRewardMode,
        KeyCode::Char('z') => OC::ActuatorOn,
        KeyCode::Char('x') => OC::ActuatorOff,
        KeyCode::Char('0') => OC::ResetDevice,
        KeyCode::Char('f') => OC::RetryFlush,
        KeyCode::Tab => OC::SwitchSide,
        KeyCode::Left => OC::PreviousTile,
        KeyCode::Right => OC::NextTile,
        KeyCode::Char(' ') => OC::ToggleTile,
        KeyCode::Char('q') | KeyCode::Esc => OC::Quit,
        _ => return None,
    };
    Some(command)
}

/// What the console remembers between frames.
#[derive(Debug)]
pub struct ConsoleState {
    side: Side,
    tile: usize,
    log: VecDeque<String>,
    quit: bool,
}

impl Default for ConsoleState {
    fn default() -> Self {
        Self {
            side: Side::Left,
            tile: 0,
            log: VecDeque::with_capacity(LOG_LINES),
            quit: false,
        }
    }
}

impl ConsoleState {
    /// True once the operator asked to leave.
    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Recent messages, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(String::as_str)
    }

    /// Wall and index of the tile cursor.
    pub fn cursor(&self) -> (Side, usize) {
        (self.side, self.tile)
    }

    /// Add a line to the on-screen log, dropping the oldest if full.
    pub fn note(&mut self, line: impl Into<String>) {
        if self.log.len() == LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line.into());
    }

    /// Carry out one operator command at time `now`.
    pub fn apply<B, R, G>(
        &mut self,
        controller: &mut SessionController<B, R, G>,
        command: OperatorCommand,
        now: f64,
    ) where
        B: DeviceBridge,
        R: RecorderControl,
        G: TrackGeometry,
    {
        use OperatorCommand as OC;
        match command {
            OC::Start => match controller.start(now) {
                Ok(()) => self.note("Session started"),
                Err(e) => self.note(format!("Cannot start: {}", e)),
            },
            OC::Conclude => match controller.conclude() {
                Ok(true) => self.note("Session saved"),
                Ok(false) => self.note("No session to conclude"),
                Err(e) => self.note(format!("{}, press f to retry", e)),
            },
            OC::ToggleTest => match controller.toggle_test() {
                Ok(SessionState::TestRun) => self.note("Test run started"),
                Ok(_) => self.note("Test run stopped"),
                Err(e) => self.note(format!("Cannot test: {}", e)),
            },
            OC::ReconnectRecorder => {
                if controller.connect_recorder() {
                    self.note("Connecting to recorder...");
                }
            }
            OC::ToggleRewardMode => {
                let enabled = !controller.gate().is_enabled();
                controller.set_reward_mode(enabled);
                self.note(format!("Reward mode {}", if enabled { "on" } else { "off" }));
            }
            OC::ActuatorOn => controller.actuator_on(),
            OC::ActuatorOff => controller.actuator_off(),
            OC::ResetDevice => controller.reset_device(),
            OC::RetryFlush => match controller.retry_flush() {
                Ok(0) => self.note("Nothing to save"),
                Ok(n) => self.note(format!("Saved {} samples", n)),
                Err(e) => self.note(format!("Still cannot save: {}", e)),
            },
            OC::SwitchSide => {
                self.side = match self.side {
                    Side::Left => Side::Right,
                    Side::Right => Side::Left,
                }
            }
            OC::PreviousTile => self.tile = (self.tile + TILES_PER_SIDE - 1) % TILES_PER_SIDE,
            OC::NextTile => self.tile = (self.tile + 1) % TILES_PER_SIDE,
            OC::ToggleTile => {
                let reward = !controller.gate().is_reward_tile(self.side, self.tile);
                controller.set_reward_tile(self.side, self.tile, reward);
            }
            OC::Quit => self.quit = true,
        }
    }

    fn record(&mut self, event: &ControllerEvent) {
        if let Some(line) = describe(event) {
            self.note(line);
        }
    }
}

/// A log line for `event`, or `None` for events too frequent to list.
pub fn describe(event: &ControllerEvent) -> Option<String> {
    let line = match event {
        ControllerEvent::RecorderConnected => "Recorder connected".to_owned(),
        ControllerEvent::RecorderFailed => "Recorder connection failed, press r".to_owned(),
        ControllerEvent::DeviceConnected => "Treadmill connected".to_owned(),
        ControllerEvent::DeviceDisconnected => "Treadmill disconnected".to_owned(),
        ControllerEvent::MalformedReading(raw) => format!("Bad reading {:?}", raw),
        ControllerEvent::DeviceWriteFailed(command) => format!("Could not send {}", command),
        ControllerEvent::RewardTriggered(trigger) => {
            format!("Reward at {:?} tile {}", trigger.side, trigger.tile)
        }
        ControllerEvent::LapCompleted { context } => format!("Lap complete, context {}", context),
        ControllerEvent::FlashFinished => "Back at the start".to_owned(),
        ControllerEvent::PlateShade(_) => return None,
    };
    Some(line)
}

/// The status block as text lines.
pub fn status_lines<B, R, G>(controller: &SessionController<B, R, G>) -> Vec<Line<'static>>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    let state = match controller.state() {
        SessionState::Idle => "Idle".white(),
        SessionState::Running => "Recording".red().bold(),
        SessionState::TestRun => "Test run".yellow().bold(),
    };
    let recorder = match controller.recorder().state() {
        ConnectionState::Disconnected => "disconnected".white(),
        ConnectionState::Connecting => "connecting...".yellow(),
        ConnectionState::Connected => "connected".green(),
        ConnectionState::Failed => "FAILED".red().bold(),
    };
    let plate = match controller.plate_shade() {
        PlateShade::Light => "light",
        PlateShade::Dark => "dark",
    };
    let output = controller
        .output_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "(none)".to_owned());

    let mut lines = vec![
        Line::from(vec!["State: ".into(), state]),
        Line::from(vec!["Recorder: ".into(), recorder]),
        Line::from(format!(
            "Distance: {:.2} (raw {:.2})  Position: {}",
            controller.cyclic_distance(),
            controller.raw_distance(),
            controller.position()
        )),
        Line::from(format!(
            "Context: {}  Plate: {}  Translating: {}",
            controller.context(),
            plate,
            controller.is_translating()
        )),
        Line::from(format!(
            "Reward mode: {}  Relay: {}",
            if controller.gate().is_enabled() { "on" } else { "off" },
            if controller.actuator_engaged() { "closed" } else { "open" }
        )),
        Line::from(format!(
            "Output: {}  Samples: {}",
            output,
            controller.samples().len()
        )),
    ];
    if controller.recorder().acquisition_misconfigured() {
        lines.push(Line::from(
            "Recorder reports acquisition misconfigured".red().bold(),
        ));
    }
    if !controller.unflushed().is_empty() {
        lines.push(Line::from(Span::styled(
            format!("{} samples not saved, press f", controller.unflushed().len()),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
    }
    lines
}

fn tile_line<B, R, G>(
    controller: &SessionController<B, R, G>,
    ui: &ConsoleState,
    side: Side,
) -> Line<'static>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    let gate = controller.gate();
    let mut spans: Vec<Span<'static>> = vec![format!("{:<6}", format!("{:?}", side)).into()];
    for tile in 0..TILES_PER_SIDE {
        let mark = match (gate.is_reward_tile(side, tile), gate.is_armed(side, tile)) {
            (true, true) => "[R]".green(),
            (true, false) => "[r]".dark_gray(),
            (false, _) => "[ ]".white(),
        };
        let mark = if ui.cursor() == (side, tile) {
            mark.reversed()
        } else {
            mark
        };
        spans.push(mark);
    }
    Line::from(spans)
}

fn draw<B, R, G>(frame: &mut Frame, controller: &SessionController<B, R, G>, ui: &ConsoleState)
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    let status = status_lines(controller);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(status.len() as u16 + 2),
            Constraint::Length(4),
            Constraint::Min(3),
        ])
        .split(frame.size());

    let title = Title::from(" NeuroMaze ".cyan().bold());
    let status_block = Block::default()
        .title(title.alignment(Alignment::Center))
        .borders(Borders::ALL);
    frame.render_widget(Paragraph::new(status).block(status_block), chunks[0]);

    let tiles = Paragraph::new(vec![
        tile_line(controller, ui, Side::Left),
        tile_line(controller, ui, Side::Right),
    ])
    .block(
        Block::default()
            .title(" Reward tiles <Tab>/<Left>/<Right>/<Space> ")
            .borders(Borders::ALL),
    );
    frame.render_widget(tiles, chunks[1]);

    let instructions = Title::from(Line::from(vec![
        " Start ".into(),
        "<S>".cyan().bold(),
        " Conclude ".into(),
        "<C>".cyan().bold(),
        " Test ".into(),
        "<T>".cyan().bold(),
        " Recorder ".into(),
        "<R>".cyan().bold(),
        " Reward ".into(),
        "<W>".cyan().bold(),
        " Relay ".into(),
        "<Z>/<X>".cyan().bold(),
        " Save ".into(),
        "<F>".cyan().bold(),
        " Quit ".into(),
        "<Q> ".cyan().bold(),
    ]));
    let visible = chunks[2].height.saturating_sub(2) as usize;
    let skip = ui.log.len().saturating_sub(visible);
    let items: Vec<ListItem> = ui.log().skip(skip).map(ListItem::new).collect();
    let log = List::new(items).block(
        Block::default()
            .title(" Events ")
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL),
    );
    frame.render_widget(log, chunks[2]);
}

/// Run the controller under the operator's console until they quit.
pub fn operator_console<B, R, G>(
    controller: &mut SessionController<B, R, G>,
    pacer: &mut Pacer,
) -> Result<(), ConsoleError>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let res = run(controller, pacer);
    if let Err(e) = &res {
        error!("Console stopped: {}", e);
    }
    save_before_exit(controller);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    res
}

/// Saves whatever is still only in memory: the running session, or samples
/// from an earlier failed save. Returns how many samples are still unsaved.
pub fn save_before_exit<B, R, G>(controller: &mut SessionController<B, R, G>) -> usize
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    let res = if controller.is_recording() {
        info!("Leaving mid-session, saving first");
        controller.conclude().map(|_| ())
    } else {
        controller.retry_flush().map(|_| ())
    };
    if let Err(e) = res {
        error!("Could not save before leaving: {}", e);
    }

    let lost = controller.unflushed().len();
    if lost > 0 {
        error!("{} samples were never saved", lost);
    }
    lost
}

fn run<B, R, G>(
    controller: &mut SessionController<B, R, G>,
    pacer: &mut Pacer,
) -> Result<(), ConsoleError>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;
    let mut ui = ConsoleState::default();
    let mut ticks: u64 = 0;

    while !ui.should_quit() {
        let now = pacer.now();

        while event::poll(Duration::ZERO)? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(command) = command_for(key.code) {
                        ui.apply(controller, command, now);
                    }
                }
            }
        }

        for event in controller.tick(now) {
            ui.record(&event);
        }

        if ticks % REDRAW_EVERY == 0 {
            terminal.draw(|frame| draw(frame, controller, &ui))?;
        }
        ticks += 1;
        pacer.wait();
    }
    Ok(())
}

/// Run a single recorded session of `duration_secs` without a terminal,
/// logging events as they happen.
pub fn headless_session<B, R, G>(
    controller: &mut SessionController<B, R, G>,
    pacer: &mut Pacer,
    duration_secs: f64,
    connect_timeout: Duration,
) -> Result<(), ConsoleError>
where
    B: DeviceBridge,
    R: RecorderControl,
    G: TrackGeometry,
{
    controller.connect_recorder();
    // Give the recorder its full connect timeout plus a little slack.
    let give_up = pacer.now() + connect_timeout.as_secs_f64() + 1.0;
    while controller.recorder().state() == ConnectionState::Connecting && pacer.now() < give_up {
        log_events(controller.tick(pacer.now()));
        pacer.wait();
    }

    let started = pacer.now();
    controller.start(started)?;
    while pacer.now() - started < duration_secs {
        log_events(controller.tick(pacer.now()));
        pacer.wait();
    }

    match controller.conclude() {
        Ok(_) => Ok(()),
        Err(SessionError::Persist(e)) => {
            warn!("Retrying save once: {}", e);
            controller.retry_flush()?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn log_events(events: Vec<ControllerEvent>) {
    for line in events.iter().filter_map(describe) {
        info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, RecorderConfig};
    use crate::dummy_bridge::DummyBridge;
    use crate::geometry::StraightTrack;
    use crate::recorder_client::RecorderClient;

    type Controller = SessionController<DummyBridge, RecorderClient, StraightTrack>;

    fn controller() -> Controller {
        SessionController::new(
            ControllerConfig::default(),
            DummyBridge::builder().build(),
            RecorderClient::new(RecorderConfig::default()),
            StraightTrack::default(),
        )
    }

    fn text(lines: &[Line]) -> String {
        lines
            .iter()
            .flat_map(|line| line.spans.iter().map(|span| span.content.to_string()))
            .collect()
    }

    #[test]
    fn keys_map_to_commands() {
        assert_eq!(command_for(KeyCode::Char('s')), Some(OperatorCommand::Start));
        assert_eq!(command_for(KeyCode::Char('z')), Some(OperatorCommand::ActuatorOn));
        assert_eq!(command_for(KeyCode::Char('x')), Some(OperatorCommand::ActuatorOff));
        assert_eq!(command_for(KeyCode::Esc), Some(OperatorCommand::Quit));
        assert_eq!(command_for(KeyCode::Char('?')), None);
    }

    #[test]
    fn refused_start_is_reported() {
        let mut c = controller();
        let mut ui = ConsoleState::default();
        ui.apply(&mut c, OperatorCommand::Start, 0.0);
        assert_eq!(c.state(), SessionState::Idle);
        assert!(ui.log().any(|l| l.contains("output directory")));
    }

    #[test]
    fn tile_cursor_wraps_and_toggles() {
        let mut c = controller();
        let mut ui = ConsoleState::default();

        ui.apply(&mut c, OperatorCommand::PreviousTile, 0.0);
        assert_eq!(ui.cursor(), (Side::Left, TILES_PER_SIDE - 1));
        ui.apply(&mut c, OperatorCommand::SwitchSide, 0.0);
        ui.apply(&mut c, OperatorCommand::ToggleTile, 0.0);
        assert!(c.gate().is_reward_tile(Side::Right, TILES_PER_SIDE - 1));
        ui.apply(&mut c, OperatorCommand::ToggleTile, 0.0);
        assert!(!c.gate().is_reward_tile(Side::Right, TILES_PER_SIDE - 1));
    }

    #[test]
    fn reward_mode_toggles() {
        let mut c = controller();
        let mut ui = ConsoleState::default();
        ui.apply(&mut c, OperatorCommand::ToggleRewardMode, 0.0);
        assert!(c.gate().is_enabled());
        ui.apply(&mut c, OperatorCommand::ToggleRewardMode, 0.0);
        assert!(!c.gate().is_enabled());
    }

    #[test]
    fn log_keeps_the_newest_lines() {
        let mut ui = ConsoleState::default();
        for i in 0..LOG_LINES + 10 {
            ui.note(i.to_string());
        }
        assert_eq!(ui.log().count(), LOG_LINES);
        assert_eq!(ui.log().next(), Some("10"));
    }

    #[test]
    fn status_shows_state_and_recorder() {
        let mut c = controller();
        let idle = text(&status_lines(&c));
        assert!(idle.contains("Idle"));
        assert!(idle.contains("disconnected"));
        assert!(idle.contains("(none)"));

        c.toggle_test().unwrap();
        assert!(text(&status_lines(&c)).contains("Test run"));
    }

    #[test]
    fn flash_steps_stay_out_of_the_log() {
        assert_eq!(describe(&ControllerEvent::PlateShade(PlateShade::Light)), None);
        assert!(describe(&ControllerEvent::LapCompleted { context: 1 })
            .unwrap()
            .contains("context 1"));
    }

    #[test]
    fn quit_is_remembered() {
        let mut c = controller();
        let mut ui = ConsoleState::default();
        assert!(!ui.should_quit());
        ui.apply(&mut c, OperatorCommand::Quit, 0.0);
        assert!(ui.should_quit());
    }

    #[test]
    fn leaving_mid_session_saves_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path());
        c.start(0.0).unwrap();
        for i in 0..3 {
            c.tick(i as f64 * 0.02);
        }

        assert_eq!(save_before_exit(&mut c), 0);
        assert_eq!(c.state(), SessionState::Idle);
        let blocks =
            crate::position_log::read_from_path(dir.path().join("position.txt")).unwrap();
        assert_eq!(blocks[0].len(), 3);
    }

    #[test]
    fn unsaved_samples_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller();
        c.set_output_dir(dir.path().join("missing"));
        c.start(0.0).unwrap();
        for i in 0..4 {
            c.tick(i as f64 * 0.02);
        }

        assert_eq!(save_before_exit(&mut c), 4);
        assert!(!c.is_recording());

        c.set_output_dir(dir.path());
        assert_eq!(save_before_exit(&mut c), 0);
    }
}
