pub mod terminal;

pub use terminal::{TerminalChannel, TerminalHandle, TerminalSink, parse_line, terminal_pair};
