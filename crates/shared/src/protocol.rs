use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Attributes, ChannelId, ChannelStatus, ChannelType, Identity, MemberStatus, MessageId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Connect {
        token: String,
        identity: Identity,
    },
    UpdateToken {
        token: String,
    },
    ListChannels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    CreateChannel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        friendly_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unique_name: Option<String>,
        channel_type: ChannelType,
        #[serde(default)]
        attributes: Attributes,
    },
    JoinChannel {
        channel_id: ChannelId,
    },
    DeclineInvitation {
        channel_id: ChannelId,
    },
    LeaveChannel {
        channel_id: ChannelId,
    },
    DestroyChannel {
        channel_id: ChannelId,
    },
    SetAttributes {
        channel_id: ChannelId,
        attributes: Attributes,
    },
    SetFriendlyName {
        channel_id: ChannelId,
        friendly_name: String,
    },
    SetUniqueName {
        channel_id: ChannelId,
        unique_name: String,
    },
    ListMembers {
        channel_id: ChannelId,
    },
    AddMember {
        channel_id: ChannelId,
        identity: Identity,
    },
    InviteMember {
        channel_id: ChannelId,
        identity: Identity,
    },
    RemoveMember {
        channel_id: ChannelId,
        identity: Identity,
    },
    FetchMessages {
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
        limit: u32,
    },
    SendMessage {
        channel_id: ChannelId,
        body: String,
        /// Client-chosen correlation value echoed back on the stored message.
        nonce: String,
    },
    UpdateMessage {
        channel_id: ChannelId,
        message_id: MessageId,
        body: String,
    },
    RemoveMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    Typing {
        channel_id: ChannelId,
    },
    RegisterPushToken {
        token_b64: String,
    },
    DeregisterPushToken {
        token_b64: String,
    },
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::UpdateToken { .. } => "update_token",
            Self::ListChannels { .. } => "list_channels",
            Self::CreateChannel { .. } => "create_channel",
            Self::JoinChannel { .. } => "join_channel",
            Self::DeclineInvitation { .. } => "decline_invitation",
            Self::LeaveChannel { .. } => "leave_channel",
            Self::DestroyChannel { .. } => "destroy_channel",
            Self::SetAttributes { .. } => "set_attributes",
            Self::SetFriendlyName { .. } => "set_friendly_name",
            Self::SetUniqueName { .. } => "set_unique_name",
            Self::ListMembers { .. } => "list_members",
            Self::AddMember { .. } => "add_member",
            Self::InviteMember { .. } => "invite_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::FetchMessages { .. } => "fetch_messages",
            Self::SendMessage { .. } => "send_message",
            Self::UpdateMessage { .. } => "update_message",
            Self::RemoveMessage { .. } => "remove_message",
            Self::Typing { .. } => "typing",
            Self::RegisterPushToken { .. } => "register_push_token",
            Self::DeregisterPushToken { .. } => "deregister_push_token",
        }
    }
}

/// Server-assigned ordering stamp, increasing with every state change. Zero
/// marks a record the server did not stamp.
pub type Revision = u64;

/// Whether a record stamped `incoming` may replace state stamped `known`.
/// Unstamped records always apply.
pub fn supersedes(incoming: Revision, known: Revision) -> bool {
    incoming == 0 || incoming > known
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_name: Option<String>,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub identity: Identity,
    pub status: MemberStatus,
    #[serde(default)]
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub author: Identity,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerReply {
    Ack,
    Channel {
        channel: ChannelRecord,
    },
    ChannelPage {
        channels: Vec<ChannelRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_cursor: Option<String>,
    },
    Members {
        members: Vec<MemberRecord>,
    },
    Member {
        member: MemberRecord,
    },
    /// A deletion, stamped with the revision it produced.
    Removed {
        revision: Revision,
    },
    Message {
        message: MessageRecord,
    },
    MessagePage {
        messages: Vec<MessageRecord>,
        complete: bool,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ChannelAdded {
        channel: ChannelRecord,
    },
    ChannelUpdated {
        channel: ChannelRecord,
    },
    ChannelDeleted {
        channel_id: ChannelId,
    },
    MemberJoined {
        channel_id: ChannelId,
        member: MemberRecord,
    },
    MemberUpdated {
        channel_id: ChannelId,
        member: MemberRecord,
    },
    MemberLeft {
        channel_id: ChannelId,
        identity: Identity,
        #[serde(default)]
        revision: Revision,
    },
    MessageAdded {
        channel_id: ChannelId,
        message: MessageRecord,
    },
    MessageUpdated {
        channel_id: ChannelId,
        message: MessageRecord,
    },
    MessageRemoved {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    TypingStarted {
        channel_id: ChannelId,
        identity: Identity,
    },
    TypingEnded {
        channel_id: ChannelId,
        identity: Identity,
    },
    TransportFault {
        error: ApiError,
    },
}

/// One delivery from the realtime transport. Redeliveries reuse `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub event: ServerEvent,
}

impl ServerEnvelope {
    pub fn new(event_id: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            event_id: Some(event_id.into()),
            event,
        }
    }

    pub fn anonymous(event: ServerEvent) -> Self {
        Self {
            event_id: None,
            event,
        }
    }
}

/// Out-of-band notification body as delivered by the platform push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(alias = "channelId", alias = "channel_sid")]
    pub channel_id: ChannelId,
    #[serde(alias = "messageId", alias = "message_sid")]
    pub message_id: MessageId,
    #[serde(default)]
    pub author: Option<Identity>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl PushPayload {
    /// Returns the full message when the payload carries enough to apply it.
    pub fn message_record(&self) -> Option<MessageRecord> {
        Some(MessageRecord {
            message_id: self.message_id.clone(),
            author: self.author.clone()?,
            body: self.body.clone()?,
            created_at: self.created_at?,
            updated_at: None,
            last_updated_by: None,
            nonce: None,
            revision: 0,
        })
    }
}
