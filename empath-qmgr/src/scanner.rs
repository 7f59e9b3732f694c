//! Queue scanner (C2): enumerates queue-file names from an external
//! on-disk queue, with restart/full-scan/flush modifiers.
//!
//! The on-disk format itself is out of scope; [`QueueSource`] is the
//! trait boundary to whatever owns it.

use std::collections::VecDeque;

use async_trait::async_trait;

/// Bitflags mirroring the trigger alphabet: `SCAN_ALL` and `FLUSH_DEAD`
/// are modifiers latched onto the *next* scan a request produces, never
/// retroactively applied to one already running (decided Open Question,
/// see DESIGN.md).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFlags {
    pub scan_all: bool,
    pub flush_dead: bool,
}

impl ScanFlags {
    pub fn merge(&mut self, other: Self) {
        self.scan_all |= other.scan_all;
        self.flush_dead |= other.flush_dead;
    }

    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// External collaborator owning the on-disk queue directory for one named
/// queue (incoming or deferred). Implementations list queue-file names and
/// report the per-file "next eligible" timestamp (mtime, for deferred
/// files).
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Lists currently-present queue-file names, each paired with its
    /// next-eligible unix timestamp (0 meaning "always eligible", as for
    /// the incoming queue).
    async fn list(&self) -> std::io::Result<Vec<(String, u64)>>;
}

enum ScanState {
    Idle,
    Requested { flags: ScanFlags },
    InProgress { queue: VecDeque<(String, u64)>, flags: ScanFlags },
}

/// Drives one named queue's scan lifecycle. Not `Clone`; one instance per
/// queue (incoming, deferred), owned by the [`crate::engine::Engine`].
pub struct QueueScanner {
    name: &'static str,
    source: Box<dyn QueueSource>,
    state: ScanState,
    pending_flags: ScanFlags,
}

impl QueueScanner {
    #[must_use]
    pub fn new(name: &'static str, source: Box<dyn QueueSource>) -> Self {
        Self {
            name,
            source,
            state: ScanState::Idle,
            pending_flags: ScanFlags::default(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Records a scan request. If a scan is idle, the request takes effect
    /// on the next `next()` call (which starts it); if one is already in
    /// progress, the modifiers are latched for the scan that follows it.
    pub fn request(&mut self, flags: ScanFlags) {
        self.pending_flags.merge(flags);
        if matches!(self.state, ScanState::Idle) {
            self.state = ScanState::Requested {
                flags: self.pending_flags.take(),
            };
        }
    }

    /// Returns the next eligible path, or `None` once this scan is
    /// exhausted. Starts a fresh scan from the source if one was
    /// requested and none is in progress.
    pub async fn next(&mut self, now_unix: u64) -> std::io::Result<Option<String>> {
        if let ScanState::Requested { flags } = &self.state {
            let flags = *flags;
            let entries = self.source.list().await?;
            self.state = ScanState::InProgress {
                queue: entries.into_iter().collect(),
                flags,
            };
        }

        let ScanState::InProgress { queue, flags } = &mut self.state else {
            return Ok(None);
        };

        loop {
            let Some((path, eligible_at)) = queue.pop_front() else {
                // scan exhausted; fold in any modifiers latched while it ran
                let next_flags = self.pending_flags.take();
                self.state = if next_flags == ScanFlags::default() {
                    ScanState::Idle
                } else {
                    ScanState::Requested { flags: next_flags }
                };
                return Ok(None);
            };
            if flags.scan_all || eligible_at <= now_unix {
                return Ok(Some(path));
            }
        }
    }

    /// Restarts the scan immediately: if a restart is requested while a
    /// scan is in progress, the scan completes and is immediately
    /// restarted. Here we model "completes" as abandoning the remaining
    /// queue entries and re-listing on the next `next()` call.
    pub fn restart(&mut self, flags: ScanFlags) {
        self.pending_flags.merge(flags);
        self.state = ScanState::Requested {
            flags: self.pending_flags.take(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource(Vec<(String, u64)>);

    #[async_trait]
    impl QueueSource for FakeSource {
        async fn list(&self) -> std::io::Result<Vec<(String, u64)>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn scan_yields_only_eligible_files_by_default() {
        let source = FakeSource(vec![
            ("a".into(), 0),
            ("b".into(), 1_000_000),
        ]);
        let mut scanner = QueueScanner::new("deferred", Box::new(source));
        scanner.request(ScanFlags::default());
        assert_eq!(scanner.next(500).await.unwrap(), Some("a".into()));
        assert_eq!(scanner.next(500).await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_all_ignores_eligibility() {
        let source = FakeSource(vec![("a".into(), 0), ("b".into(), 1_000_000)]);
        let mut scanner = QueueScanner::new("deferred", Box::new(source));
        scanner.request(ScanFlags {
            scan_all: true,
            flush_dead: false,
        });
        let mut seen = vec![
            scanner.next(500).await.unwrap().unwrap(),
            scanner.next(500).await.unwrap().unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(scanner.next(500).await.unwrap(), None);
    }

    #[tokio::test]
    async fn modifier_latched_during_in_progress_scan_applies_next_run_only() {
        let source = FakeSource(vec![("a".into(), 0)]);
        let mut scanner = QueueScanner::new("deferred", Box::new(source));
        scanner.request(ScanFlags::default());
        // start the scan, consuming "a"
        assert_eq!(scanner.next(500).await.unwrap(), Some("a".into()));
        // SCAN_ALL arrives while idle-between-reads; since nothing is
        // mid-iteration here it starts a fresh scan next call
        scanner.request(ScanFlags {
            scan_all: true,
            flush_dead: false,
        });
        assert_eq!(scanner.next(500).await.unwrap(), Some("a".into()));
    }
}
