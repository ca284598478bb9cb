use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use shared::{
    domain::{
        Attributes, ChannelId, ChannelStatus, ChannelType, Identity, MemberStatus, MessageId,
    },
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        ChannelRecord, ClientRequest, MemberRecord, MessageRecord, Revision, ServerEnvelope,
        ServerEvent, ServerReply,
    },
};
use tokio::{sync::broadcast, time};
use tracing::debug;

use crate::transport::Transport;

type Handled = std::result::Result<(ServerReply, Vec<ServerEvent>), ApiException>;

enum Fault {
    Reject(ApiError),
    Network(String),
    Delay(Duration),
}

#[derive(Default)]
struct ServerState {
    identity: Option<Identity>,
    channels: Vec<ChannelRecord>,
    members: HashMap<ChannelId, Vec<MemberRecord>>,
    messages: HashMap<ChannelId, Vec<MessageRecord>>,
    push_tokens: Vec<Vec<u8>>,
    next_channel: u64,
    next_message: u64,
    next_event: u64,
    revision: Revision,
    faults: VecDeque<(&'static str, Fault)>,
    requests: Vec<ClientRequest>,
    holding: bool,
    held: Vec<ServerEnvelope>,
}

/// In-memory stand-in for the messaging service.
///
/// Requests mutate a single-user view of the server and, like the real
/// service, echo the resulting events on the realtime stream. Faults queued
/// with [`LoopbackTransport::fail_next`] and friends apply to the next request
/// of the named kind.
pub struct LoopbackTransport {
    state: Mutex<ServerState>,
    events: broadcast::Sender<ServerEnvelope>,
    page_size: usize,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_page_size(50)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(ServerState::default()),
            events,
            page_size: page_size.max(1),
        }
    }

    /// While holding, request side effects are queued instead of echoed on
    /// the event stream. Turning holding off does not release the queue.
    pub fn hold_echoes(&self, holding: bool) {
        self.state().holding = holding;
    }

    /// Publishes every held echo in the order the server produced it.
    pub fn release_echoes(&self) -> usize {
        let held = std::mem::take(&mut self.state().held);
        let count = held.len();
        for envelope in held {
            self.inject(envelope);
        }
        count
    }

    pub fn fail_next(&self, request: &'static str, error: ApiError) {
        self.state().faults.push_back((request, Fault::Reject(error)));
    }

    pub fn fail_next_network(&self, request: &'static str, message: impl Into<String>) {
        self.state()
            .faults
            .push_back((request, Fault::Network(message.into())));
    }

    pub fn delay_next(&self, request: &'static str, delay: Duration) {
        self.state().faults.push_back((request, Fault::Delay(delay)));
    }

    pub fn seed_channel(&self, channel: ChannelRecord) {
        let mut state = self.state();
        state.members.entry(channel.channel_id.clone()).or_default();
        state.messages.entry(channel.channel_id.clone()).or_default();
        state.channels.push(channel);
    }

    pub fn seed_member(&self, channel_id: &ChannelId, member: MemberRecord) {
        self.state()
            .members
            .entry(channel_id.clone())
            .or_default()
            .push(member);
    }

    pub fn seed_message(&self, channel_id: &ChannelId, message: MessageRecord) {
        self.state()
            .messages
            .entry(channel_id.clone())
            .or_default()
            .push(message);
    }

    /// Stores a message from another participant and publishes it.
    pub fn remote_message(
        &self,
        channel_id: &ChannelId,
        author: Identity,
        body: impl Into<String>,
    ) -> MessageRecord {
        let record = {
            let mut state = self.state();
            let record = MessageRecord {
                message_id: state.message_id(),
                author,
                body: body.into(),
                created_at: Utc::now(),
                updated_at: None,
                last_updated_by: None,
                nonce: None,
                revision: state.next_revision(),
            };
            state
                .messages
                .entry(channel_id.clone())
                .or_default()
                .push(record.clone());
            record
        };
        self.emit(ServerEvent::MessageAdded {
            channel_id: channel_id.clone(),
            message: record.clone(),
        });
        record
    }

    /// Publishes an event under a fresh event id and returns the envelope, so
    /// tests can redeliver it.
    pub fn emit(&self, event: ServerEvent) -> ServerEnvelope {
        let envelope = {
            let mut state = self.state();
            ServerEnvelope::new(state.event_id(), event)
        };
        self.inject(envelope.clone());
        envelope
    }

    pub fn inject(&self, envelope: ServerEnvelope) {
        let _ = self.events.send(envelope);
    }

    pub fn requests(&self) -> Vec<ClientRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self, name: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|request| request.name() == name)
            .count()
    }

    pub fn push_tokens(&self) -> Vec<Vec<u8>> {
        self.state().push_tokens.clone()
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<ChannelRecord> {
        self.state().channel(channel_id).ok().cloned()
    }

    pub fn message_count(&self, channel_id: &ChannelId) -> usize {
        self.state()
            .messages
            .get(channel_id)
            .map_or(0, Vec::len)
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(&self, request: &ClientRequest) -> Option<Fault> {
        let mut state = self.state();
        state.requests.push(request.clone());
        let index = state
            .faults
            .iter()
            .position(|(name, _)| *name == request.name())?;
        state.faults.remove(index).map(|(_, fault)| fault)
    }

    fn handle(&self, request: ClientRequest) -> ServerReply {
        let (reply, events) = {
            let mut state = self.state();
            match state.apply(request, self.page_size) {
                Ok((reply, events)) => {
                    let envelopes: Vec<ServerEnvelope> = events
                        .into_iter()
                        .map(|event| ServerEnvelope::new(state.event_id(), event))
                        .collect();
                    if state.holding {
                        state.held.extend(envelopes);
                        (reply, Vec::new())
                    } else {
                        (reply, envelopes)
                    }
                }
                Err(err) => (ServerReply::Error(err.into()), Vec::new()),
            }
        };
        for envelope in events {
            self.inject(envelope);
        }
        reply
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn request(&self, request: ClientRequest) -> Result<ServerReply> {
        match self.take_fault(&request) {
            Some(Fault::Reject(error)) => return Ok(ServerReply::Error(error)),
            Some(Fault::Network(message)) => return Err(anyhow!(message)),
            Some(Fault::Delay(delay)) => time::sleep(delay).await,
            None => {}
        }
        debug!(request = request.name(), "loopback: handling request");
        Ok(self.handle(request))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServerEnvelope> {
        self.events.subscribe()
    }
}

fn not_found(what: impl std::fmt::Display) -> ApiException {
    ApiException::new(ErrorCode::NotFound, format!("{what} not found"))
}

impl ServerState {
    fn event_id(&mut self) -> String {
        self.next_event += 1;
        format!("ev-{}", self.next_event)
    }

    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    fn message_id(&mut self) -> MessageId {
        self.next_message += 1;
        MessageId::new(format!("IM{:04}", self.next_message))
    }

    fn me(&self) -> std::result::Result<Identity, ApiException> {
        self.identity
            .clone()
            .ok_or_else(|| ApiException::new(ErrorCode::Unauthorized, "not connected"))
    }

    fn channel(&self, channel_id: &ChannelId) -> std::result::Result<&ChannelRecord, ApiException> {
        self.channels
            .iter()
            .find(|c| &c.channel_id == channel_id)
            .ok_or_else(|| not_found(format!("channel {channel_id}")))
    }

    fn channel_mut(
        &mut self,
        channel_id: &ChannelId,
    ) -> std::result::Result<&mut ChannelRecord, ApiException> {
        self.channels
            .iter_mut()
            .find(|c| &c.channel_id == channel_id)
            .ok_or_else(|| not_found(format!("channel {channel_id}")))
    }

    fn ensure_unique(
        &self,
        channel_id: Option<&ChannelId>,
        unique_name: &str,
    ) -> std::result::Result<(), ApiException> {
        let taken = self.channels.iter().any(|c| {
            c.unique_name.as_deref() == Some(unique_name) && Some(&c.channel_id) != channel_id
        });
        if taken {
            return Err(ApiException::new(
                ErrorCode::NameConflict,
                format!("unique name {unique_name} is taken"),
            ));
        }
        Ok(())
    }

    fn set_membership(
        &mut self,
        channel_id: &ChannelId,
        identity: Identity,
        status: MemberStatus,
    ) -> (MemberRecord, Option<ServerEvent>) {
        let revision = self.revision + 1;
        let members = self.members.entry(channel_id.clone()).or_default();
        let (member, event) = match members.iter_mut().find(|m| m.identity == identity) {
            Some(existing) if existing.status == status => (existing.clone(), None),
            Some(existing) => {
                existing.status = status;
                existing.revision = revision;
                let member = existing.clone();
                let event = ServerEvent::MemberUpdated {
                    channel_id: channel_id.clone(),
                    member: member.clone(),
                };
                (member, Some(event))
            }
            None => {
                let member = MemberRecord {
                    identity,
                    status,
                    revision,
                };
                members.push(member.clone());
                let event = ServerEvent::MemberJoined {
                    channel_id: channel_id.clone(),
                    member: member.clone(),
                };
                (member, Some(event))
            }
        };
        if event.is_some() {
            self.revision = revision;
        }
        (member, event)
    }

    fn drop_membership(
        &mut self,
        channel_id: &ChannelId,
        identity: &Identity,
    ) -> Option<(Revision, ServerEvent)> {
        let members = self.members.get_mut(channel_id)?;
        let before = members.len();
        members.retain(|m| &m.identity != identity);
        if members.len() == before {
            return None;
        }
        let revision = self.next_revision();
        Some((
            revision,
            ServerEvent::MemberLeft {
                channel_id: channel_id.clone(),
                identity: identity.clone(),
                revision,
            },
        ))
    }

    fn set_status(
        &mut self,
        channel_id: &ChannelId,
        status: ChannelStatus,
    ) -> std::result::Result<(ChannelRecord, ServerEvent), ApiException> {
        let revision = self.next_revision();
        let channel = self.channel_mut(channel_id)?;
        channel.status = status;
        channel.revision = revision;
        let record = channel.clone();
        Ok((
            record.clone(),
            ServerEvent::ChannelUpdated { channel: record },
        ))
    }

    fn updated(
        &mut self,
        channel_id: &ChannelId,
        edit: impl FnOnce(&mut ChannelRecord),
    ) -> Handled {
        let revision = self.next_revision();
        let channel = self.channel_mut(channel_id)?;
        edit(channel);
        channel.revision = revision;
        let record = channel.clone();
        Ok((
            ServerReply::Channel {
                channel: record.clone(),
            },
            vec![ServerEvent::ChannelUpdated { channel: record }],
        ))
    }

    fn apply(&mut self, request: ClientRequest, page_size: usize) -> Handled {
        match request {
            ClientRequest::Connect { token, identity } => {
                if token.is_empty() {
                    return Err(ApiException::new(ErrorCode::Unauthorized, "empty token"));
                }
                self.identity = Some(identity);
                Ok((ServerReply::Ack, Vec::new()))
            }
            ClientRequest::UpdateToken { token } => {
                if token.is_empty() {
                    return Err(ApiException::new(ErrorCode::Unauthorized, "empty token"));
                }
                Ok((ServerReply::Ack, Vec::new()))
            }
            ClientRequest::ListChannels { cursor } => {
                let offset = cursor
                    .as_deref()
                    .and_then(|cursor| cursor.parse::<usize>().ok())
                    .unwrap_or(0);
                let end = (offset + page_size).min(self.channels.len());
                let channels = self.channels.get(offset..end).unwrap_or_default().to_vec();
                let next_cursor = (end < self.channels.len()).then(|| end.to_string());
                Ok((
                    ServerReply::ChannelPage {
                        channels,
                        next_cursor,
                    },
                    Vec::new(),
                ))
            }
            ClientRequest::CreateChannel {
                friendly_name,
                unique_name,
                channel_type,
                attributes,
            } => {
                if let Some(unique_name) = &unique_name {
                    self.ensure_unique(None, unique_name)?;
                }
                let me = self.me()?;
                self.next_channel += 1;
                let record = ChannelRecord {
                    channel_id: ChannelId::new(format!("CH{:04}", self.next_channel)),
                    friendly_name,
                    unique_name,
                    channel_type,
                    status: ChannelStatus::Joined,
                    attributes,
                    revision: self.next_revision(),
                };
                self.channels.push(record.clone());
                self.messages.entry(record.channel_id.clone()).or_default();
                let (_, joined) = self.set_membership(&record.channel_id, me, MemberStatus::Joined);
                let mut events = vec![ServerEvent::ChannelAdded {
                    channel: record.clone(),
                }];
                events.extend(joined);
                Ok((ServerReply::Channel { channel: record }, events))
            }
            ClientRequest::JoinChannel { channel_id } => {
                let channel = self.channel(&channel_id)?;
                if channel.channel_type == ChannelType::Private
                    && channel.status != ChannelStatus::Invited
                {
                    return Err(ApiException::new(
                        ErrorCode::Forbidden,
                        "private channel requires an invitation",
                    ));
                }
                let me = self.me()?;
                let (record, updated) = self.set_status(&channel_id, ChannelStatus::Joined)?;
                let (_, joined) = self.set_membership(&channel_id, me, MemberStatus::Joined);
                let mut events = vec![updated];
                events.extend(joined);
                Ok((ServerReply::Channel { channel: record }, events))
            }
            ClientRequest::DeclineInvitation { channel_id } | ClientRequest::LeaveChannel { channel_id } => {
                let me = self.me()?;
                let (record, updated) =
                    self.set_status(&channel_id, ChannelStatus::NotParticipating)?;
                let mut events = vec![updated];
                events.extend(self.drop_membership(&channel_id, &me).map(|(_, left)| left));
                Ok((ServerReply::Channel { channel: record }, events))
            }
            ClientRequest::DestroyChannel { channel_id } => {
                self.channel(&channel_id)?;
                self.channels.retain(|c| c.channel_id != channel_id);
                self.members.remove(&channel_id);
                self.messages.remove(&channel_id);
                Ok((
                    ServerReply::Ack,
                    vec![ServerEvent::ChannelDeleted { channel_id }],
                ))
            }
            ClientRequest::SetAttributes {
                channel_id,
                attributes,
            } => self.updated(&channel_id, |c| c.attributes = attributes),
            ClientRequest::SetFriendlyName {
                channel_id,
                friendly_name,
            } => self.updated(&channel_id, |c| c.friendly_name = Some(friendly_name)),
            ClientRequest::SetUniqueName {
                channel_id,
                unique_name,
            } => {
                self.ensure_unique(Some(&channel_id), &unique_name)?;
                self.updated(&channel_id, |c| c.unique_name = Some(unique_name))
            }
            ClientRequest::ListMembers { channel_id } => {
                self.channel(&channel_id)?;
                let members = self.members.get(&channel_id).cloned().unwrap_or_default();
                Ok((ServerReply::Members { members }, Vec::new()))
            }
            ClientRequest::AddMember {
                channel_id,
                identity,
            } => {
                self.channel(&channel_id)?;
                let (member, event) =
                    self.set_membership(&channel_id, identity, MemberStatus::Joined);
                Ok((ServerReply::Member { member }, event.into_iter().collect()))
            }
            ClientRequest::InviteMember {
                channel_id,
                identity,
            } => {
                self.channel(&channel_id)?;
                let joined = self.members.get(&channel_id).and_then(|members| {
                    members
                        .iter()
                        .find(|m| m.identity == identity && m.status == MemberStatus::Joined)
                        .cloned()
                });
                if let Some(member) = joined {
                    return Ok((ServerReply::Member { member }, Vec::new()));
                }
                let (member, event) =
                    self.set_membership(&channel_id, identity, MemberStatus::Invited);
                Ok((ServerReply::Member { member }, event.into_iter().collect()))
            }
            ClientRequest::RemoveMember {
                channel_id,
                identity,
            } => {
                self.channel(&channel_id)?;
                let (revision, left) = self
                    .drop_membership(&channel_id, &identity)
                    .ok_or_else(|| not_found(format!("member {identity}")))?;
                Ok((ServerReply::Removed { revision }, vec![left]))
            }
            ClientRequest::FetchMessages {
                channel_id,
                before,
                limit,
            } => {
                self.channel(&channel_id)?;
                let mut messages = self.messages.get(&channel_id).cloned().unwrap_or_default();
                messages.sort_by_key(|m| m.created_at);
                let end = match &before {
                    Some(before) => messages
                        .iter()
                        .position(|m| &m.message_id == before)
                        .ok_or_else(|| not_found(format!("message {before}")))?,
                    None => messages.len(),
                };
                let start = end.saturating_sub(limit.max(1) as usize);
                Ok((
                    ServerReply::MessagePage {
                        messages: messages[start..end].to_vec(),
                        complete: start == 0,
                    },
                    Vec::new(),
                ))
            }
            ClientRequest::SendMessage {
                channel_id,
                body,
                nonce,
            } => {
                self.channel(&channel_id)?;
                let author = self.me()?;
                let record = MessageRecord {
                    message_id: self.message_id(),
                    author,
                    body,
                    created_at: Utc::now(),
                    updated_at: None,
                    last_updated_by: None,
                    nonce: Some(nonce),
                    revision: self.next_revision(),
                };
                self.messages
                    .entry(channel_id.clone())
                    .or_default()
                    .push(record.clone());
                Ok((
                    ServerReply::Message {
                        message: record.clone(),
                    },
                    vec![ServerEvent::MessageAdded {
                        channel_id,
                        message: record,
                    }],
                ))
            }
            ClientRequest::UpdateMessage {
                channel_id,
                message_id,
                body,
            } => {
                let me = self.me()?;
                let revision = self.next_revision();
                let message = self
                    .messages
                    .get_mut(&channel_id)
                    .and_then(|messages| messages.iter_mut().find(|m| m.message_id == message_id))
                    .ok_or_else(|| not_found(format!("message {message_id}")))?;
                message.body = body;
                message.updated_at = Some(Utc::now());
                message.last_updated_by = Some(me);
                message.revision = revision;
                let record = message.clone();
                Ok((
                    ServerReply::Message {
                        message: record.clone(),
                    },
                    vec![ServerEvent::MessageUpdated {
                        channel_id,
                        message: record,
                    }],
                ))
            }
            ClientRequest::RemoveMessage {
                channel_id,
                message_id,
            } => {
                let messages = self
                    .messages
                    .get_mut(&channel_id)
                    .ok_or_else(|| not_found(format!("channel {channel_id}")))?;
                let before = messages.len();
                messages.retain(|m| m.message_id != message_id);
                if messages.len() == before {
                    return Err(not_found(format!("message {message_id}")));
                }
                Ok((
                    ServerReply::Ack,
                    vec![ServerEvent::MessageRemoved {
                        channel_id,
                        message_id,
                    }],
                ))
            }
            ClientRequest::Typing { channel_id } => {
                self.channel(&channel_id)?;
                Ok((ServerReply::Ack, Vec::new()))
            }
            ClientRequest::RegisterPushToken { token_b64 } => {
                let token = STANDARD.decode(token_b64).map_err(|err| {
                    ApiException::new(ErrorCode::Validation, format!("bad push token: {err}"))
                })?;
                if !self.push_tokens.contains(&token) {
                    self.push_tokens.push(token);
                }
                Ok((ServerReply::Ack, Vec::new()))
            }
            ClientRequest::DeregisterPushToken { token_b64 } => {
                let token = STANDARD.decode(token_b64).map_err(|err| {
                    ApiException::new(ErrorCode::Validation, format!("bad push token: {err}"))
                })?;
                self.push_tokens.retain(|existing| existing != &token);
                Ok((ServerReply::Ack, Vec::new()))
            }
        }
    }
}

/// Convenience record for seeding a channel the user already belongs to.
pub fn joined_channel(channel_id: &str, unique_name: Option<&str>) -> ChannelRecord {
    ChannelRecord {
        channel_id: ChannelId::new(channel_id),
        friendly_name: None,
        unique_name: unique_name.map(str::to_owned),
        channel_type: ChannelType::Public,
        status: ChannelStatus::Joined,
        attributes: Attributes::new(),
        revision: 0,
    }
}
