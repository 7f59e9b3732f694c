//! Message loader (C3): expands a queue file's recipients through the
//! resolver, applies the relocated/virtual/deferred-transport filters, and
//! binds each surviving recipient to a destination queue.

use async_trait::async_trait;

use crate::{
    config::EngineConfig,
    entity::EntityStore,
    error::ResolverError,
    message::{Message, MessageId, RecipientEntry, RecipientState},
};

/// One recipient record as read from the queue file, before resolution.
#[derive(Debug, Clone)]
pub struct RawRecipient {
    pub address: String,
    pub offset: u64,
    /// Backoff interval this recipient was last deferred with, carried
    /// forward from the deferred file's stamp by whatever re-loads it; zero
    /// for a recipient seen for the first time.
    pub last_interval_secs: u64,
}

/// Resolver reply: the transport/nexthop a recipient resolves to, its
/// rewritten address, and any of the out-of-band signals the resolver
/// can raise.
#[derive(Debug, Clone)]
pub struct ResolvedRecipient {
    pub transport: String,
    pub nexthop: String,
    pub rewritten_address: String,
}

/// External collaborator mapping `(sender, recipient)` to a transport,
/// nexthop, and rewritten address. Out of scope to implement here; only
/// the trait boundary lives in this crate.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        sender: &str,
        recipient: &str,
    ) -> Result<ResolvedRecipient, ResolverError>;
}

/// Outcome of filtering+resolving one raw recipient.
pub enum LoadedRecipient {
    /// Bound to a destination queue for eventual delivery or deferral.
    Bound(RecipientEntry),
    /// Silently discarded (double-bounce address).
    Discarded,
    /// Bounced immediately without a delivery attempt (relocated table
    /// match).
    Bounced { address: String, reason: String },
    /// The message has already bound as many recipients as
    /// `message_recipient_limit` allows; this raw record was not resolved
    /// or bound at all. The caller should stop streaming this message's
    /// recipients and resume later from this record's offset.
    CapExceeded,
}

/// Reads one cohort of recipients, resolves and filters each, and binds
/// the survivors into the entity store. Recipient streaming for messages
/// larger than `message_recipient_limit` is handled by the caller feeding
/// successive `RawRecipient` cohorts using `Message::resume_offset`.
pub struct MessageLoader<'a> {
    config: &'a EngineConfig,
    store: &'a EntityStore,
    resolver: &'a dyn Resolver,
}

impl<'a> MessageLoader<'a> {
    #[must_use]
    pub const fn new(config: &'a EngineConfig, store: &'a EntityStore, resolver: &'a dyn Resolver) -> Self {
        Self { config, store, resolver }
    }

    /// Resolves and filters one raw recipient for `message`, returning the
    /// outcome without mutating the destination queue (the caller appends
    /// `Bound` entries so it can update `Message` bookkeeping atomically).
    pub async fn load_recipient(
        &self,
        message: &Message,
        raw: RawRecipient,
    ) -> Result<LoadedRecipient, ResolverError> {
        if message.recipients_total >= self.config.message_recipient_limit {
            return Ok(LoadedRecipient::CapExceeded);
        }

        if self
            .config
            .double_bounce_address
            .as_deref()
            .is_some_and(|addr| addr.eq_ignore_ascii_case(&raw.address))
        {
            return Ok(LoadedRecipient::Discarded);
        }

        if let Some(new_address) = self.config.relocated.get(&raw.address) {
            return Ok(LoadedRecipient::Bounced {
                address: raw.address,
                reason: format!("user has moved to {new_address}"),
            });
        }

        let resolved = self.resolver.resolve(&message.sender, &raw.address).await?;

        let rewritten = self.rewrite_virtual(&resolved.rewritten_address);

        // Transports listed as "deferred transports" still route through
        // the normal transport/destination graph; the concurrency
        // controller and retry/reporter treat them as permanently
        // unavailable for delivery but available for deferral accounting,
        // so no special-casing is needed here.
        let transport_id = self.store.intern_transport(&resolved.transport);
        let initial_window = self
            .config
            .initial_destination_concurrency(&resolved.transport);
        let dest_id = self
            .store
            .intern_destination(transport_id, &resolved.nexthop, initial_window);

        Ok(LoadedRecipient::Bound(RecipientEntry {
            address: rewritten,
            original_address: raw.address,
            message: message.id,
            destination: dest_id,
            transport: transport_id,
            offset: raw.offset,
            state: RecipientState::Pending,
            last_interval_secs: raw.last_interval_secs,
        }))
    }

    fn rewrite_virtual(&self, address: &str) -> String {
        let Some((local, domain)) = address.split_once('@') else {
            return address.to_string();
        };
        self.config
            .virtual_domains
            .get(domain)
            .map_or_else(|| address.to_string(), |rewritten| format!("{local}@{rewritten}"))
    }
}

#[must_use]
pub fn is_corrupt_marker(data: &[u8]) -> bool {
    // A queue file with no envelope terminator at all is structurally
    // unreadable; the real framing lives in the on-disk format, out of
    // scope here, so this is a narrow sanity check usable by an external
    // `QueueSource` implementation.
    data.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityStore;
    use std::sync::Mutex;

    struct FakeResolver(Mutex<Vec<(String, String, String)>>);

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn resolve(
            &self,
            _sender: &str,
            recipient: &str,
        ) -> Result<ResolvedRecipient, ResolverError> {
            let table = self.0.lock().unwrap();
            table
                .iter()
                .find(|(addr, _, _)| addr == recipient)
                .map(|(_, transport, nexthop)| ResolvedRecipient {
                    transport: transport.clone(),
                    nexthop: nexthop.clone(),
                    rewritten_address: recipient.to_string(),
                })
                .ok_or(ResolverError::NoSuchUser)
        }
    }

    #[tokio::test]
    async fn relocated_recipient_bounces_without_resolving() {
        let mut config = EngineConfig::default();
        config
            .relocated
            .insert("old@example.com".into(), "new@example.com".into());
        let store = EntityStore::new();
        let resolver = FakeResolver(Mutex::new(vec![]));
        let loader = MessageLoader::new(&config, &store, &resolver);
        let message = Message::new(MessageId::generate(), "sender@example.com".into());

        let outcome = loader
            .load_recipient(
                &message,
                RawRecipient { address: "old@example.com".into(), offset: 0, last_interval_secs: 0 },
            )
            .await
            .unwrap();

        match outcome {
            LoadedRecipient::Bounced { reason, .. } => {
                assert_eq!(reason, "user has moved to new@example.com");
            }
            _ => panic!("expected bounce"),
        }
    }

    #[tokio::test]
    async fn double_bounce_address_is_discarded() {
        let mut config = EngineConfig::default();
        config.double_bounce_address = Some("double-bounce@example.com".into());
        let store = EntityStore::new();
        let resolver = FakeResolver(Mutex::new(vec![]));
        let loader = MessageLoader::new(&config, &store, &resolver);
        let message = Message::new(MessageId::generate(), "sender@example.com".into());

        let outcome = loader
            .load_recipient(
                &message,
                RawRecipient { address: "double-bounce@example.com".into(), offset: 0, last_interval_secs: 0 },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, LoadedRecipient::Discarded));
    }

    #[tokio::test]
    async fn ordinary_recipient_binds_to_destination() {
        let config = EngineConfig::default();
        let store = EntityStore::new();
        let resolver = FakeResolver(Mutex::new(vec![(
            "a@b.com".into(),
            "smtp".into(),
            "mx.b.com".into(),
        )]));
        let loader = MessageLoader::new(&config, &store, &resolver);
        let message = Message::new(MessageId::generate(), "sender@example.com".into());

        let outcome = loader
            .load_recipient(&message, RawRecipient { address: "a@b.com".into(), offset: 42, last_interval_secs: 0 })
            .await
            .unwrap();

        match outcome {
            LoadedRecipient::Bound(entry) => {
                assert_eq!(entry.offset, 42);
                assert_eq!(entry.original_address, "a@b.com");
            }
            _ => panic!("expected bound recipient"),
        }
    }
}
