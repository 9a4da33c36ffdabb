//! Terminal front end for the operator.

mod error;
mod operator_console;
mod port_selector;

pub use error::ConsoleError;
pub use operator_console::{
    command_for, describe, headless_session, operator_console, save_before_exit, status_lines,
    ConsoleState, OperatorCommand,
};
pub use port_selector::port_selector;
