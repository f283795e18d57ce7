//! Toast notification system: transient acknowledgements of pushed changes.

use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use podsync_proto::config::NotificationsConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
}

impl Severity {
    fn icon(self) -> &'static str {
        match self {
            Severity::Info => "·",
            Severity::Success => "✓",
        }
    }
}

/// What a handler wants the user to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub severity: Severity,
    pub message: String,
}

impl Acknowledgement {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Success,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }
}

/// Sending half handed to the handlers. Never blocks; if the presenter is
/// gone the acknowledgement is dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Acknowledgement>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Acknowledgement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, ack: Acknowledgement) {
        if self.tx.send(ack).is_err() {
            debug!("toast: presenter gone, dropping acknowledgement");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub message: String,
    pub severity: Severity,
    pub raised_at: DateTime<Local>,
    expires: Instant,
}

impl Toast {
    /// `HH:MM:SS ✓ message`
    pub fn render(&self) -> String {
        format!(
            "{} {} {}",
            self.raised_at.format("%H:%M:%S"),
            self.severity.icon(),
            self.message
        )
    }
}

pub struct ToastManager {
    toasts: VecDeque<Toast>,
    max_visible: usize,
    success_duration: Duration,
    info_duration: Duration,
}

impl ToastManager {
    pub fn new(config: &NotificationsConfig) -> Self {
        Self {
            toasts: VecDeque::new(),
            max_visible: config.max_visible.max(1),
            success_duration: config.success_duration(),
            info_duration: config.info_duration(),
        }
    }

    /// Show `ack`, evicting the oldest visible toast if the cap is reached.
    /// Returns the evicted toast, if any.
    pub fn push(&mut self, ack: Acknowledgement) -> Option<Toast> {
        self.push_at(ack, Instant::now())
    }

    pub fn push_at(&mut self, ack: Acknowledgement, now: Instant) -> Option<Toast> {
        let duration = match ack.severity {
            Severity::Success => self.success_duration,
            Severity::Info => self.info_duration,
        };
        let evicted = if self.toasts.len() >= self.max_visible {
            self.toasts.pop_front()
        } else {
            None
        };
        self.toasts.push_back(Toast {
            message: ack.message,
            severity: ack.severity,
            raised_at: Local::now(),
            expires: now + duration,
        });
        evicted
    }

    /// Remove expired toasts. Call each tick.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.toasts.retain(|t| t.expires > now);
    }

    /// Visible toasts, oldest first.
    pub fn visible(&self) -> impl Iterator<Item = &Toast> {
        self.toasts.iter()
    }

    pub fn len(&self) -> usize {
        self.toasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toasts.is_empty()
    }
}

/// Run the presenter: print each acknowledgement to `out` as it arrives and
/// expire toasts on a timer. Ends when every [`Notifier`] is dropped.
pub fn spawn_presenter<W>(
    mut manager: ToastManager,
    mut rx: mpsc::UnboundedReceiver<Acknowledgement>,
    mut out: W,
) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                ack = rx.recv() => {
                    let Some(ack) = ack else { break };
                    if let Some(evicted) = manager.push(ack) {
                        debug!("toast: evicted {:?}", evicted.message);
                    }
                    if let Some(toast) = manager.visible().last() {
                        let line = toast.render();
                        info!("toast: {}", line);
                        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                            debug!("toast: output unavailable: {}", e);
                        }
                    }
                }
                _ = ticker.tick() => manager.tick(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_visible: usize) -> ToastManager {
        ToastManager::new(&NotificationsConfig {
            max_visible,
            success_secs: 3,
            info_secs: 5,
        })
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let mut toasts = manager(2);
        let now = Instant::now();
        assert!(toasts.push_at(Acknowledgement::success("one"), now).is_none());
        assert!(toasts.push_at(Acknowledgement::success("two"), now).is_none());
        let evicted = toasts.push_at(Acknowledgement::info("three"), now).unwrap();
        assert_eq!(evicted.message, "one");

        let visible: Vec<_> = toasts.visible().map(|t| t.message.as_str()).collect();
        assert_eq!(visible, vec!["two", "three"]);
    }

    #[test]
    fn test_identical_messages_are_all_shown() {
        let mut toasts = manager(4);
        toasts.push(Acknowledgement::success("New podcast added: X"));
        toasts.push(Acknowledgement::success("New podcast added: X"));
        assert_eq!(toasts.len(), 2);
    }

    #[test]
    fn test_tick_expires_per_severity() {
        let mut toasts = manager(4);
        let now = Instant::now();
        toasts.push_at(Acknowledgement::success("short"), now);
        toasts.push_at(Acknowledgement::info("long"), now);

        toasts.tick_at(now + Duration::from_secs(4));
        let visible: Vec<_> = toasts.visible().map(|t| t.message.as_str()).collect();
        assert_eq!(visible, vec!["long"]);

        toasts.tick_at(now + Duration::from_secs(6));
        assert!(toasts.is_empty());
    }

    #[test]
    fn test_render_carries_icon() {
        let mut toasts = manager(1);
        toasts.push(Acknowledgement::success("done"));
        let line = toasts.visible().next().unwrap().render();
        assert!(line.ends_with("✓ done"));
    }

    #[tokio::test]
    async fn test_notifier_survives_missing_presenter() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.notify(Acknowledgement::info("nobody listening"));
    }

    #[derive(Clone, Default)]
    struct SharedOut(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenOut;

    impl Write for BrokenOut {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_presenter_prints_each_acknowledgement() {
        let out = SharedOut::default();
        let (notifier, rx) = Notifier::channel();
        let presenter = spawn_presenter(manager(4), rx, out.clone());

        notifier.notify(Acknowledgement::success("New podcast added: X"));
        notifier.notify(Acknowledgement::info("Podcast refreshed: Y"));
        drop(notifier);
        presenter.await.unwrap();

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("✓ New podcast added: X"));
        assert!(lines[1].ends_with("· Podcast refreshed: Y"));
    }

    #[tokio::test]
    async fn test_presenter_survives_broken_output() {
        let (notifier, rx) = Notifier::channel();
        let presenter = spawn_presenter(manager(4), rx, BrokenOut);

        notifier.notify(Acknowledgement::success("one"));
        notifier.notify(Acknowledgement::success("two"));
        drop(notifier);

        tokio::time::timeout(Duration::from_secs(5), presenter)
            .await
            .unwrap()
            .unwrap();
    }
}
