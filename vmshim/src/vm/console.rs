//! Guest console log forwarding.
//!
//! The hypervisor appends guest console output to `console.log` in the
//! working directory. While the VM runs the file is followed into the host
//! log; when boot fails its tail is dumped for diagnostics.

use crate::constants::timeouts;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::VmshimResult;

/// Tracing target for guest console lines.
pub const CONSOLE_TARGET: &str = "guest_console";

/// Lines kept when dumping the console after a failed boot.
const DUMP_TAIL_LINES: usize = 200;

/// Strips ANSI escape sequences (`ESC [ ... m`).
pub fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next_char in chars.by_ref() {
                    if next_char == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

fn emit(vm_id: &str, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let clean = strip_ansi_codes(line.trim_end_matches(['\r', '\n']));
    tracing::info!(target: CONSOLE_TARGET, vm_id = %vm_id, "{}", clean);
}

/// Follows a console log file from the start until cancelled.
pub struct ConsoleTail {
    vm_id: String,
    path: PathBuf,
}

impl ConsoleTail {
    pub fn new(vm_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            vm_id: vm_id.into(),
            path: path.into(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> VmshimResult<()> {
        let file = loop {
            match tokio::fs::File::open(&self.path).await {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(timeouts::CONSOLE_POLL) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = reader.read_until(b'\n', &mut line) => r?,
            };
            if read == 0 {
                // At EOF for now; the guest may write more.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(timeouts::CONSOLE_POLL) => continue,
                }
            }
            if line.ends_with(b"\n") {
                emit(&self.vm_id, &line);
                line.clear();
            }
        }

        if !line.is_empty() {
            emit(&self.vm_id, &line);
        }
        Ok(())
    }
}

/// Log the tail of the console for a VM that failed to boot.
///
/// Best effort: a missing or unreadable file is logged, never returned.
pub fn dump_console_log(vm_id: &str, path: &Path) {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(vm_id = %vm_id, path = %path.display(), "Could not read console log: {}", e);
            return;
        }
    };
    let text = String::from_utf8_lossy(&contents);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DUMP_TAIL_LINES);
    tracing::error!(
        vm_id = %vm_id,
        lines = lines.len() - start,
        "Guest console output follows"
    );
    for line in &lines[start..] {
        tracing::error!(target: CONSOLE_TARGET, vm_id = %vm_id, "{}", strip_ansi_codes(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[32mINFO\x1b[0m boot"), "INFO boot");
        assert_eq!(strip_ansi_codes("plain"), "plain");
        assert_eq!(strip_ansi_codes("dangling \x1b[1"), "dangling ");
    }

    #[tokio::test]
    async fn test_tail_waits_for_file_and_stops_on_cancel() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("console.log");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ConsoleTail::new("vm", &path).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&path, "line one\npartial").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_dump_missing_file_is_not_fatal() {
        dump_console_log("vm", Path::new("/nonexistent/console.log"));
    }
}
