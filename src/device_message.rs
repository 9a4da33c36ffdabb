//! The messages exchanged with the treadmill microcontroller.
//!
//! The device streams newline-terminated ASCII lines, each holding the total
//! distance counted by the optical encoder since its last reset. The host
//! answers with single-character commands. Connection and disconnection are
//! not lines at all; they are raised by the transport itself, so a numeric
//! payload can never be mistaken for one of them.

use nom::{
    character::complete::space0,
    combinator::all_consuming,
    number::complete::double,
    sequence::delimited,
    Finish, IResult,
};

use std::fmt;

/// Something the device bridge has to report to the tick loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorMessage {
    /// The transport to the device was (re)established.
    DeviceConnected,
    /// The transport to the device was lost, or an open attempt failed.
    DeviceDisconnected,
    /// A well-formed distance line.
    Reading(f64),
    /// A line that is not a finite decimal number, kept verbatim.
    Malformed(String),
}

impl SensorMessage {
    /// Classifies one line received from the device. Trailing line
    /// terminators are ignored.
    pub fn from_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        match parse_distance(line).finish() {
            Ok((_, distance)) if distance.is_finite() => SensorMessage::Reading(distance),
            _ => SensorMessage::Malformed(line.to_owned()),
        }
    }
}

fn parse_distance(s: &str) -> IResult<&str, f64> {
    all_consuming(delimited(space0, double, space0))(s)
}

/// The commands understood by the treadmill firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Zero the encoder's distance counter.
    Reset,
    /// Close the reward relay.
    ActuatorOn,
    /// Open the reward relay.
    ActuatorOff,
}

impl DeviceCommand {
    /// The single ASCII token written to the wire for this command.
    pub fn token(self) -> u8 {
        match self {
            DeviceCommand::Reset => b'R',
            DeviceCommand::ActuatorOn => b'Z',
            DeviceCommand::ActuatorOff => b'X',
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ('{}')", self, self.token() as char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_numbers_are_readings() {
        assert_eq!(SensorMessage::from_line("12.5\n"), SensorMessage::Reading(12.5));
        assert_eq!(SensorMessage::from_line("0\r\n"), SensorMessage::Reading(0.0));
        assert_eq!(SensorMessage::from_line(" 7 "), SensorMessage::Reading(7.0));
        assert_eq!(SensorMessage::from_line("-3.25"), SensorMessage::Reading(-3.25));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            SensorMessage::from_line("garbage\n"),
            SensorMessage::Malformed("garbage".to_owned())
        );
        assert_eq!(
            SensorMessage::from_line("12.5abc"),
            SensorMessage::Malformed("12.5abc".to_owned())
        );
        assert_eq!(
            SensorMessage::from_line(""),
            SensorMessage::Malformed(String::new())
        );
    }

    #[test]
    fn non_finite_values_are_malformed() {
        assert!(matches!(
            SensorMessage::from_line("inf"),
            SensorMessage::Malformed(_)
        ));
        assert!(matches!(
            SensorMessage::from_line("NaN"),
            SensorMessage::Malformed(_)
        ));
    }

    #[test]
    fn sentinel_text_is_never_a_connection_event() {
        // Connection events only come from the transport, whatever the line says.
        let msg = SensorMessage::from_line("__Connected__");
        assert_eq!(msg, SensorMessage::Malformed("__Connected__".to_owned()));
    }

    #[test]
    fn command_tokens() {
        assert_eq!(DeviceCommand::Reset.token(), b'R');
        assert_eq!(DeviceCommand::ActuatorOn.token(), b'Z');
        assert_eq!(DeviceCommand::ActuatorOff.token(), b'X');
    }
}
