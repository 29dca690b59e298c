//! Running VMs: orchestration, console, and stdio.

mod console;
mod running;
mod stdio;

pub use console::{CONSOLE_TARGET, ConsoleTail, dump_console_log, strip_ansi_codes};
pub use running::{OciVmConfig, RunningVm, VmContext, VmExit};
pub use stdio::{StdioForwarder, StdioPaths};
