//! Small helpers shared by the logging code.

pub mod format;
