//! Log mirroring to the attached signaling client.
//!
//! Server-side diagnostics are written to two sinks: the process tracing
//! output, and (when a client is attached) the session's notification
//! channel, so an operator watching the demo page sees the same lines as
//! the server console. Call sites depend only on this handle, never on
//! the transport behind it.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A cloneable two-sink log handle.
///
/// The notification sink is optional and swapped in/out as signaling
/// clients attach and detach; lines emitted while no client is attached
/// only reach the tracing output.
#[derive(Clone, Default)]
pub struct LogSink {
    mirror: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the active client's notification channel.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.mirror.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Detach the notification channel (client disconnected).
    pub fn detach(&self) {
        *self.mirror.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether a client notification channel is currently attached.
    pub fn is_attached(&self) -> bool {
        self.mirror.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn mirror_line(&self, line: &str) {
        let guard = self.mirror.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            // A full or closed channel just means the client is gone.
            let _ = tx.send(line.to_string());
        }
    }

    pub fn info(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::info!("{}", line);
        self.mirror_line(line);
    }

    pub fn warn(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::warn!("{}", line);
        self.mirror_line(&format!("WARN: {line}"));
    }

    pub fn error(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::error!("{}", line);
        self.mirror_line(&format!("ERROR: {line}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_only_while_attached() {
        let sink = LogSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        sink.info("before attach");
        assert!(rx.try_recv().is_err());

        sink.attach(tx);
        sink.info("hello");
        assert_eq!(rx.try_recv().unwrap(), "hello");

        sink.detach();
        sink.info("after detach");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn warn_and_error_are_prefixed() {
        let sink = LogSink::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.attach(tx);

        sink.warn("disk full");
        assert_eq!(rx.try_recv().unwrap(), "WARN: disk full");

        sink.error("it broke");
        assert_eq!(rx.try_recv().unwrap(), "ERROR: it broke");
    }

    #[test]
    fn send_failure_is_ignored() {
        let sink = LogSink::new();
        let (tx, rx) = mpsc::unbounded_channel();
        sink.attach(tx);
        drop(rx);

        // Receiver gone; must not panic.
        sink.info("into the void");
    }
}
