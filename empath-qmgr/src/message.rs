//! In-core entities: messages, recipients, delivery jobs.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::{DestId, TransportId};

/// Stable identifier for a queued message, independent of any in-core
/// representation. Backed by a ULID the way `empath-spool`'s
/// `SpooledMessageId` is, so it sorts by arrival time and round-trips
/// through a queue-file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains("..") {
            return None;
        }
        Ulid::from_string(filename).ok().map(Self)
    }

    #[must_use]
    pub fn as_filename(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recipient's position in the pending → in-flight → done lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Pending,
    InFlight,
    Done,
}

/// One recipient entry, owned by exactly one destination queue and exactly
/// one message.
#[derive(Debug, Clone)]
pub struct RecipientEntry {
    pub address: String,
    pub original_address: String,
    pub message: MessageId,
    pub destination: DestId,
    pub transport: TransportId,
    /// Byte offset of this recipient's record in the queue file, echoed
    /// back by the delivery agent in its status stream.
    pub offset: u64,
    pub state: RecipientState,
    /// Backoff interval this recipient was deferred with last time, so a
    /// fresh soft failure doubles from there instead of resetting to the
    /// floor. Zero for a recipient that has never been deferred.
    pub last_interval_secs: u64,
}

/// Terminal outcome recorded for a recipient once delivery (or bounce,
/// or repeated deferral) has run its course for this attempt.
#[derive(Debug, Clone)]
pub enum RecipientStatus {
    Delivered,
    Deferred { reason: String, retry_at: SystemTime },
    Bounced { reason: String },
}

/// One transport's worth of work for one message: which recipients of the
/// message resolved to this transport, grouped by destination ("peer").
#[derive(Debug, Default)]
pub struct DeliveryJob {
    pub transport: TransportId,
    pub message: MessageId,
    /// Destinations this job has recipients bound to, insertion order.
    pub peers: Vec<DestId>,
    /// Recipients still pending or in-flight on this transport.
    pub remaining: usize,
    /// Accumulated delivery-slot credit while this job sits in a lower
    /// stack frame beneath a preempting job.
    pub slots_used: usize,
    pub slots_available: usize,
}

impl DeliveryJob {
    #[must_use]
    pub fn new(transport: TransportId, message: MessageId) -> Self {
        Self {
            transport,
            message,
            peers: Vec::new(),
            remaining: 0,
            slots_used: 0,
            slots_available: 0,
        }
    }

    pub fn bind_peer(&mut self, dest: DestId) {
        if !self.peers.contains(&dest) {
            self.peers.push(dest);
        }
    }

    /// Credits one completed delivery toward this job's slot counter,
    /// producing a new available slot every `cost` completions.
    pub fn record_completion(&mut self, cost: usize) {
        if cost == 0 {
            return;
        }
        self.slots_used += 1;
        if self.slots_used % cost == 0 {
            self.slots_available += 1;
        }
    }

    /// Resets slot accounting; called whenever this job is preempted or
    /// when it terminates.
    pub fn reset_slots(&mut self) {
        self.slots_used = 0;
        self.slots_available = 0;
    }
}

/// An in-core message: the parent of every recipient entry and delivery
/// job derived from one queue file.
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub arrival_time: SystemTime,
    pub sender: String,
    /// File offset at which recipient loading should resume, for messages
    /// with more recipients than the per-message cap.
    pub resume_offset: u64,
    pub fully_loaded: bool,
    /// Jobs this message owns, one per transport it touches.
    pub jobs: Vec<TransportId>,
    pub recipients_total: usize,
    pub recipients_terminal: usize,
}

impl Message {
    #[must_use]
    pub fn new(id: MessageId, sender: String) -> Self {
        Self {
            id,
            arrival_time: SystemTime::now(),
            sender,
            resume_offset: 0,
            fully_loaded: false,
            jobs: Vec::new(),
            recipients_total: 0,
            recipients_terminal: 0,
        }
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.arrival_time.elapsed().unwrap_or_default()
    }

    /// A message is removable once every recipient ever bound to it has
    /// reached terminal status and it has no more data to load.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fully_loaded && self.recipients_terminal >= self.recipients_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_filename_roundtrip() {
        let id = MessageId::generate();
        let filename = id.as_filename();
        assert_eq!(MessageId::from_filename(&filename), Some(id));
    }

    #[test]
    fn message_id_rejects_path_traversal() {
        assert_eq!(MessageId::from_filename("../etc/passwd"), None);
        assert_eq!(MessageId::from_filename("a/b"), None);
        assert_eq!(MessageId::from_filename("not-a-ulid"), None);
    }

    #[test]
    fn job_slot_accounting() {
        let mut job = DeliveryJob::new(TransportId::from_raw(0), MessageId::generate());
        for _ in 0..9 {
            job.record_completion(5);
        }
        assert_eq!(job.slots_available, 1);
        job.reset_slots();
        assert_eq!(job.slots_available, 0);
        assert_eq!(job.slots_used, 0);
    }

    #[test]
    fn message_completion() {
        let mut m = Message::new(MessageId::generate(), "a@b".into());
        m.recipients_total = 2;
        m.fully_loaded = true;
        assert!(!m.is_complete());
        m.recipients_terminal = 2;
        assert!(m.is_complete());
    }
}
