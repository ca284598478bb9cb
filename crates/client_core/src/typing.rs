use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::domain::{ChannelId, Identity};
use tokio::{
    task::JoinHandle,
    time::{sleep, Instant},
};

/// Posted by an expiry timer. Stale generations are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TypingExpiry {
    pub(crate) channel_id: ChannelId,
    pub(crate) identity: Identity,
    pub(crate) generation: u64,
}

type ExpiryNotifier = Arc<dyn Fn(TypingExpiry) + Send + Sync>;

struct TypingEntry {
    started_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

pub(crate) struct TypingTracker {
    timeout: Duration,
    notify: ExpiryNotifier,
    entries: HashMap<(ChannelId, Identity), TypingEntry>,
    next_generation: u64,
}

impl TypingTracker {
    pub(crate) fn new(timeout: Duration, notify: ExpiryNotifier) -> Self {
        Self {
            timeout,
            notify,
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Starts or refreshes the indicator. Returns true only for a fresh start.
    pub(crate) fn begin(&mut self, channel_id: &ChannelId, identity: &Identity) -> bool {
        let generation = self.next_generation;
        self.next_generation += 1;
        let timer = self.arm(TypingExpiry {
            channel_id: channel_id.clone(),
            identity: identity.clone(),
            generation,
        });

        let key = (channel_id.clone(), identity.clone());
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.timer.abort();
                entry.timer = timer;
                entry.generation = generation;
                false
            }
            None => {
                self.entries.insert(
                    key,
                    TypingEntry {
                        started_at: Instant::now(),
                        generation,
                        timer,
                    },
                );
                true
            }
        }
    }

    pub(crate) fn end(&mut self, channel_id: &ChannelId, identity: &Identity) -> bool {
        match self.entries.remove(&(channel_id.clone(), identity.clone())) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn expire(&mut self, expiry: &TypingExpiry) -> bool {
        let key = (expiry.channel_id.clone(), expiry.identity.clone());
        match self.entries.get(&key) {
            Some(entry) if entry.generation == expiry.generation => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Drops every indicator in the channel without reporting them as ended.
    pub(crate) fn clear_channel(&mut self, channel_id: &ChannelId) {
        self.entries.retain(|(channel, _), entry| {
            if channel == channel_id {
                entry.timer.abort();
                false
            } else {
                true
            }
        });
    }

    /// Identities typing in the channel, longest-running first.
    pub(crate) fn typing_in(&self, channel_id: &ChannelId) -> Vec<Identity> {
        let mut typing: Vec<(&Instant, &Identity)> = self
            .entries
            .iter()
            .filter(|((channel, _), _)| channel == channel_id)
            .map(|((_, identity), entry)| (&entry.started_at, identity))
            .collect();
        typing.sort();
        typing.into_iter().map(|(_, identity)| identity.clone()).collect()
    }

    pub(crate) fn shutdown(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }

    fn arm(&self, expiry: TypingExpiry) -> JoinHandle<()> {
        let notify = Arc::clone(&self.notify);
        let timeout = self.timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            notify(expiry);
        })
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
