use shared::domain::{ChannelId, Identity, MessageId};

use crate::{channel::ChannelSnapshot, error::SyncError, members::Member, messages::Message};

/// Externally observable state transitions, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChannelAdded(ChannelSnapshot),
    ChannelChanged(ChannelSnapshot),
    ChannelDeleted(ChannelSnapshot),
    ChannelHistoryLoaded(ChannelSnapshot),
    MemberJoined {
        channel_id: ChannelId,
        member: Member,
    },
    MemberChanged {
        channel_id: ChannelId,
        member: Member,
    },
    MemberLeft {
        channel_id: ChannelId,
        member: Member,
    },
    MessageAdded {
        channel_id: ChannelId,
        message: Message,
    },
    MessageChanged {
        channel_id: ChannelId,
        message: Message,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message: Message,
    },
    TypingStarted {
        channel_id: ChannelId,
        identity: Identity,
    },
    TypingEnded {
        channel_id: ChannelId,
        identity: Identity,
    },
    ToastSubscribed,
    ToastReceived {
        channel_id: ChannelId,
        message_id: MessageId,
        /// Present when the notification carried the full message.
        message: Option<Message>,
    },
    ToastRegistrationFailed(SyncError),
    Error(SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelAdded,
    ChannelChanged,
    ChannelDeleted,
    ChannelHistoryLoaded,
    MemberJoined,
    MemberChanged,
    MemberLeft,
    MessageAdded,
    MessageChanged,
    MessageDeleted,
    TypingStarted,
    TypingEnded,
    ToastSubscribed,
    ToastReceived,
    ToastRegistrationFailed,
    Error,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ChannelAdded(_) => EventKind::ChannelAdded,
            Self::ChannelChanged(_) => EventKind::ChannelChanged,
            Self::ChannelDeleted(_) => EventKind::ChannelDeleted,
            Self::ChannelHistoryLoaded(_) => EventKind::ChannelHistoryLoaded,
            Self::MemberJoined { .. } => EventKind::MemberJoined,
            Self::MemberChanged { .. } => EventKind::MemberChanged,
            Self::MemberLeft { .. } => EventKind::MemberLeft,
            Self::MessageAdded { .. } => EventKind::MessageAdded,
            Self::MessageChanged { .. } => EventKind::MessageChanged,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::TypingStarted { .. } => EventKind::TypingStarted,
            Self::TypingEnded { .. } => EventKind::TypingEnded,
            Self::ToastSubscribed => EventKind::ToastSubscribed,
            Self::ToastReceived { .. } => EventKind::ToastReceived,
            Self::ToastRegistrationFailed(_) => EventKind::ToastRegistrationFailed,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// The channel the event concerns, if any.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::ChannelAdded(channel)
            | Self::ChannelChanged(channel)
            | Self::ChannelDeleted(channel)
            | Self::ChannelHistoryLoaded(channel) => Some(&channel.channel_id),
            Self::MemberJoined { channel_id, .. }
            | Self::MemberChanged { channel_id, .. }
            | Self::MemberLeft { channel_id, .. }
            | Self::MessageAdded { channel_id, .. }
            | Self::MessageChanged { channel_id, .. }
            | Self::MessageDeleted { channel_id, .. }
            | Self::TypingStarted { channel_id, .. }
            | Self::TypingEnded { channel_id, .. }
            | Self::ToastReceived { channel_id, .. } => Some(channel_id),
            Self::ToastSubscribed | Self::ToastRegistrationFailed(_) | Self::Error(_) => None,
        }
    }
}
