//! Delivery progress reporting.
//!
//! `swatch broadcast` can fan out to many recipients.
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event while delivering one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryProgressEvent {
    /// Eligible recipients selected; nothing sent yet.
    Started { total: u64 },
    /// `n` of `total` attempts settled, `failed` of them unsuccessfully.
    Sending { n: u64, total: u64, failed: u64 },
}

/// Receives progress events from the notifier.
pub trait DeliveryProgressReporter: Send + Sync {
    fn report(&self, event: DeliveryProgressEvent);
}

/// Human-friendly progress: "notify  sending  12 / 1,040 recipients (1 failed)".
pub struct StderrProgress;

impl DeliveryProgressReporter for StderrProgress {
    fn report(&self, event: DeliveryProgressEvent) {
        let line = match &event {
            DeliveryProgressEvent::Started { total } => {
                format!("notify  {} recipients\n", format_number(*total))
            }
            DeliveryProgressEvent::Sending { n, total, failed } => {
                let mut line = format!(
                    "notify  sending  {} / {} recipients",
                    format_number(*n),
                    format_number(*total)
                );
                if *failed > 0 {
                    line.push_str(&format!(" ({} failed)", format_number(*failed)));
                }
                line.push('\n');
                line
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl DeliveryProgressReporter for JsonProgress {
    fn report(&self, event: DeliveryProgressEvent) {
        let obj = match &event {
            DeliveryProgressEvent::Started { total } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "total": total
            }),
            DeliveryProgressEvent::Sending { n, total, failed } => serde_json::json!({
                "event": "progress",
                "phase": "sending",
                "n": n,
                "total": total,
                "failed": failed
            }),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", obj);
        let _ = stderr.flush();
    }
}

pub struct NoProgress;

impl DeliveryProgressReporter for NoProgress {
    fn report(&self, _event: DeliveryProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode selected on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn DeliveryProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
