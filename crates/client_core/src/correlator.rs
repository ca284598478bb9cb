use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use shared::{
    domain::{ChannelId, MessageId},
    protocol::{PushPayload, ServerEnvelope, ServerEvent},
};

use crate::error::{CommandResult, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CorrelationKey {
    Event(String),
    MessageAdded(ChannelId, MessageId),
    MessageRemoved(ChannelId, MessageId),
}

/// Bounded memory of already-applied deliveries. The oldest key is forgotten
/// first once the window is full.
pub(crate) struct NotificationCorrelator {
    capacity: usize,
    order: VecDeque<CorrelationKey>,
    seen: HashSet<CorrelationKey>,
}

impl NotificationCorrelator {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub(crate) fn keys_for(envelope: &ServerEnvelope) -> Vec<CorrelationKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(event_id) = &envelope.event_id {
            keys.push(CorrelationKey::Event(event_id.clone()));
        }
        match &envelope.event {
            ServerEvent::MessageAdded {
                channel_id,
                message,
            } => keys.push(CorrelationKey::MessageAdded(
                channel_id.clone(),
                message.message_id.clone(),
            )),
            ServerEvent::MessageRemoved {
                channel_id,
                message_id,
            } => keys.push(CorrelationKey::MessageRemoved(
                channel_id.clone(),
                message_id.clone(),
            )),
            _ => {}
        }
        keys
    }

    pub(crate) fn is_duplicate(&self, keys: &[CorrelationKey]) -> bool {
        keys.iter().any(|key| self.seen.contains(key))
    }

    pub(crate) fn record(&mut self, key: CorrelationKey) {
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    pub(crate) fn record_all(&mut self, keys: Vec<CorrelationKey>) {
        for key in keys {
            self.record(key);
        }
    }
}

pub(crate) fn parse_push(payload: Value) -> CommandResult<PushPayload> {
    // Some push services nest the body under "data".
    let payload = match payload {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("channel_id") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|err| SyncError::Validation(format!("malformed push payload: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn window_forgets_oldest_keys_first() {
        let mut correlator = NotificationCorrelator::new(2);
        correlator.record(CorrelationKey::Event("e1".into()));
        correlator.record(CorrelationKey::Event("e2".into()));
        correlator.record(CorrelationKey::Event("e2".into()));
        assert!(correlator.is_duplicate(&[CorrelationKey::Event("e1".into())]));

        correlator.record(CorrelationKey::Event("e3".into()));
        assert!(!correlator.is_duplicate(&[CorrelationKey::Event("e1".into())]));
        assert!(correlator.is_duplicate(&[CorrelationKey::Event("e2".into())]));
    }

    #[test]
    fn message_events_key_on_content_as_well_as_event_id() {
        let envelope = ServerEnvelope::new(
            "ev-7",
            ServerEvent::MessageRemoved {
                channel_id: ChannelId::new("CH1"),
                message_id: MessageId::new("IM1"),
            },
        );
        assert_eq!(
            NotificationCorrelator::keys_for(&envelope),
            vec![
                CorrelationKey::Event("ev-7".into()),
                CorrelationKey::MessageRemoved(ChannelId::new("CH1"), MessageId::new("IM1")),
            ]
        );
    }

    #[test]
    fn events_without_an_id_are_keyed_by_content_only() {
        let removed = ServerEnvelope::anonymous(ServerEvent::MessageRemoved {
            channel_id: ChannelId::new("CH1"),
            message_id: MessageId::new("IM2"),
        });
        assert_eq!(
            NotificationCorrelator::keys_for(&removed),
            vec![CorrelationKey::MessageRemoved(
                ChannelId::new("CH1"),
                MessageId::new("IM2")
            )]
        );

        let typing = ServerEnvelope::anonymous(ServerEvent::TypingStarted {
            channel_id: ChannelId::new("CH1"),
            identity: shared::domain::Identity::new("bob"),
        });
        let keys = NotificationCorrelator::keys_for(&typing);
        assert!(keys.is_empty());
        assert!(!NotificationCorrelator::new(4).is_duplicate(&keys));
    }

    #[test]
    fn push_payload_accepts_platform_aliases() {
        let push = parse_push(json!({
            "data": {
                "channelId": "CH1",
                "messageId": "IM4",
                "author": "bob",
                "body": "hello",
                "timestamp": "2024-05-01T10:00:00Z"
            }
        }))
        .expect("parse");
        assert_eq!(push.channel_id, ChannelId::new("CH1"));
        assert!(push.message_record().is_some());

        let bare = parse_push(json!({"channel_id": "CH1", "message_id": "IM5"})).expect("parse");
        assert!(bare.message_record().is_none());

        assert!(parse_push(json!({"body": "no ids"})).is_err());
    }
}
