//! Shell execution: the file-IPC bash driver and its supporting pieces.

pub mod driver;
pub mod protocol;
pub mod spawn;
pub mod tempfiles;

pub use driver::{DriverOptions, ExecOutcome, ShellDriver};
