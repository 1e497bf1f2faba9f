//! Terminal observer: streamed text to stdout, progress and errors to stderr.

use std::io::{self, Write};

use chorus_core::Observer;

/// Writes pipeline events to a pair of output streams.
pub struct ConsoleObserver<MakeOut, MakeErr> {
    out: MakeOut,
    err: MakeErr,
}

/// Observer over the process's own stdout and stderr.
pub type TerminalObserver = ConsoleObserver<fn() -> io::Stdout, fn() -> io::Stderr>;

impl TerminalObserver {
    /// Observer writing to stdout and stderr.
    #[must_use]
    pub fn terminal() -> Self {
        Self::new(io::stdout, io::stderr)
    }
}

impl<MakeOut, MakeErr, OutWriter, ErrWriter> ConsoleObserver<MakeOut, MakeErr>
where
    MakeOut: Fn() -> OutWriter,
    MakeErr: Fn() -> ErrWriter,
    OutWriter: Write,
    ErrWriter: Write,
{
    /// Observer writing through the given stream factories.
    pub const fn new(out: MakeOut, err: MakeErr) -> Self {
        Self { out, err }
    }

    /// Writes `text` to the output stream as-is.
    pub fn print(&self, text: &str) {
        let mut out = (self.out)();
        write!(out, "{text}").unwrap_or(());
        out.flush().unwrap_or(());
    }

    fn error_line(&self, line: &str) {
        let mut err = (self.err)();
        writeln!(err, "{line}").unwrap_or(());
    }
}

impl<MakeOut, MakeErr, OutWriter, ErrWriter> Observer for ConsoleObserver<MakeOut, MakeErr>
where
    MakeOut: Fn() -> OutWriter + Send + Sync,
    MakeErr: Fn() -> ErrWriter + Send + Sync,
    OutWriter: Write,
    ErrWriter: Write,
{
    fn on_stream_chunk(&self, agent_number: u32, model: &str, text: &str, is_first: bool) {
        let mut out = (self.out)();
        if is_first {
            writeln!(out, "\n=== Agent {agent_number} ({model}) ===").unwrap_or(());
        }
        write!(out, "{text}").unwrap_or(());
        out.flush().unwrap_or(());
    }

    fn on_log(&self, message: &str) {
        self.error_line(&format!("[chorus] {message}"));
    }

    fn on_agent_error(&self, agent_number: u32, message: &str) {
        self.error_line(&format!("[agent {agent_number}] {message}"));
    }

    fn on_complete(&self) {
        let mut out = (self.out)();
        writeln!(out).unwrap_or(());
        out.flush().unwrap_or(());
    }

    fn on_fatal_error(&self, message: &str) {
        self.error_line(&format!("[chorus] fatal: {message}"));
    }
}
