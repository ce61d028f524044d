/// Learner Console - Captured Output
///
/// **Responsibility:**
/// Collect what learner code writes through `console.*` for one run.
///
/// **Rules:**
/// - `log` and `info` lines are stored as written; `warn` and `error` get a
///   `WARN: ` or `ERROR: ` prefix
/// - Past the line ceiling, one truncation marker is stored and later writes
///   are dropped
/// - A sealed console discards writes, so an abandoned run cannot append to a
///   settled outcome
/// - With capture off, lines go to the host log instead

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Default)]
struct Buffer {
    lines: Vec<String>,
    sealed: bool,
    truncated: bool,
}

/// Call-local console handed to one interpreter run
///
/// Cloning shares the buffer, so the executor keeps a handle while the
/// interpreter thread writes. Once sealed, writes are discarded.
#[derive(Debug, Clone)]
pub struct Console {
    buffer: Arc<Mutex<Buffer>>,
    capture: bool,
    max_lines: usize,
}

impl Console {
    pub fn new(capture: bool, max_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Buffer::default())),
            capture,
            max_lines,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self, level: ConsoleLevel, text: String) {
        let line = match level {
            ConsoleLevel::Log | ConsoleLevel::Info => text,
            ConsoleLevel::Warn => format!("WARN: {}", text),
            ConsoleLevel::Error => format!("ERROR: {}", text),
        };

        let mut buffer = self.lock();
        if buffer.sealed {
            return;
        }
        if !self.capture {
            drop(buffer);
            match level {
                ConsoleLevel::Log | ConsoleLevel::Info => info!(target: "learner_console", "{}", line),
                ConsoleLevel::Warn => warn!(target: "learner_console", "{}", line),
                ConsoleLevel::Error => error!(target: "learner_console", "{}", line),
            }
            return;
        }
        if buffer.lines.len() >= self.max_lines {
            if !buffer.truncated {
                buffer.truncated = true;
                buffer
                    .lines
                    .push(format!("... output truncated after {} lines", self.max_lines));
            }
            return;
        }
        buffer.lines.push(line);
    }

    /// Stops accepting output; later writes from an abandoned run are dropped
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_prefixed() {
        let console = Console::new(true, 10);
        console.write(ConsoleLevel::Log, "plain".into());
        console.write(ConsoleLevel::Warn, "careful".into());
        console.write(ConsoleLevel::Error, "bad".into());

        assert_eq!(console.snapshot(), vec!["plain", "WARN: careful", "ERROR: bad"]);
    }

    #[test]
    fn test_sealed_console_drops_writes() {
        let console = Console::new(true, 10);
        let handle = console.clone();
        console.write(ConsoleLevel::Log, "before".into());
        handle.seal();
        console.write(ConsoleLevel::Log, "after".into());

        assert_eq!(handle.snapshot(), vec!["before"]);
    }

    #[test]
    fn test_passthrough_captures_nothing() {
        let console = Console::new(false, 10);
        console.write(ConsoleLevel::Log, "to the host log".into());
        assert!(console.snapshot().is_empty());
    }

    #[test]
    fn test_line_ceiling_adds_one_marker() {
        let console = Console::new(true, 2);
        for i in 0..5 {
            console.write(ConsoleLevel::Log, i.to_string());
        }
        let lines = console.snapshot();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "... output truncated after 2 lines");
    }
}
