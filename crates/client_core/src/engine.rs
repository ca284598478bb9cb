use std::sync::{Arc, Weak};

use serde_json::Value;
use shared::domain::{Attributes, ChannelId, Identity};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::{
    access::{AccessEvent, AccessManager},
    channel::{ChannelOptions, ChannelSnapshot, StatusChange},
    config::Settings,
    coordinator::Responder,
    dispatcher::{ClientObserver, EventDispatcher, ObserverHandle},
    error::{CommandResult, SyncError},
    events::ClientEvent,
    members::Member,
    messages::Message,
    transport::Transport,
    typing::TypingExpiry,
    worker::{EngineWorker, Route},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the initial connect; commands are held back.
    Connecting,
    Active,
    /// Token expired; commands are held back until it is refreshed.
    Paused,
    /// Connect was rejected; commands fail until a new token arrives.
    Failed,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberOp {
    Add,
    Invite,
    Remove,
}

#[derive(Debug)]
pub(crate) enum Command {
    LoadChannels,
    CreateChannel(ChannelOptions),
    ChangeStatus(ChannelId, StatusChange),
    Destroy(ChannelId),
    SetAttributes(ChannelId, Attributes),
    SetFriendlyName(ChannelId, String),
    SetUniqueName(ChannelId, String),
    Member(ChannelId, Identity, MemberOp),
    SendMessage(ChannelId, Message),
    UpdateMessage(ChannelId, Uuid, String),
    RemoveMessage(ChannelId, Uuid),
    PushToken { token: Vec<u8>, register: bool },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::LoadChannels => "load_channels",
            Self::CreateChannel(_) => "create_channel",
            Self::ChangeStatus(_, change) => change.name(),
            Self::Destroy(_) => "destroy_channel",
            Self::SetAttributes(..) => "set_attributes",
            Self::SetFriendlyName(..) => "set_friendly_name",
            Self::SetUniqueName(..) => "set_unique_name",
            Self::Member(_, _, MemberOp::Add) => "add_member",
            Self::Member(_, _, MemberOp::Invite) => "invite_member",
            Self::Member(_, _, MemberOp::Remove) => "remove_member",
            Self::SendMessage(..) => "send_message",
            Self::UpdateMessage(..) => "update_message",
            Self::RemoveMessage(..) => "remove_message",
            Self::PushToken { register: true, .. } => "register_push_token",
            Self::PushToken { register: false, .. } => "deregister_push_token",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Query {
    Channels(oneshot::Sender<Vec<ChannelSnapshot>>),
    ChannelById(ChannelId, oneshot::Sender<Option<ChannelSnapshot>>),
    ChannelByUniqueName(String, oneshot::Sender<Option<ChannelSnapshot>>),
    Members(ChannelId, oneshot::Sender<Option<Vec<Member>>>),
    Messages(ChannelId, oneshot::Sender<Option<Vec<Message>>>),
    Typing(ChannelId, oneshot::Sender<Vec<Identity>>),
    Session(oneshot::Sender<SessionState>),
}

/// Everything the worker reacts to, in one ordered queue.
pub(crate) enum EngineInput {
    Command {
        command: Command,
        responder: Responder,
    },
    Query(Query),
    Reply {
        route: Route,
        result: anyhow::Result<shared::protocol::ServerReply>,
    },
    Server(shared::protocol::ServerEnvelope),
    Push(Value),
    Access(AccessEvent),
    TypingExpired(TypingExpiry),
    LocalTyping(ChannelId),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Client-side mirror of one user's messaging session.
///
/// All state lives on a single worker task. Every method here only enqueues
/// work, so none of them block on the network. Must be started inside a tokio
/// runtime.
pub struct SyncEngine {
    inbox: mpsc::UnboundedSender<EngineInput>,
    dispatcher: EventDispatcher,
    identity: Identity,
}

impl SyncEngine {
    pub fn start(
        settings: Settings,
        access: Arc<dyn AccessManager>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let dispatcher = EventDispatcher::spawn(settings.event_buffer);
        let identity = access.identity();
        EngineWorker::spawn(settings, access, transport, &inbox, dispatcher.clone(), rx);
        Arc::new(Self {
            inbox,
            dispatcher,
            identity,
        })
    }

    pub fn version() -> &'static str {
        VERSION
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Registers an observer for every event. The engine keeps only a weak
    /// reference; dropping the observer unregisters it.
    pub fn add_observer<O: ClientObserver + 'static>(&self, observer: &Arc<O>) -> ObserverHandle {
        let weak: Weak<dyn ClientObserver> = Arc::downgrade(observer) as Weak<dyn ClientObserver>;
        self.dispatcher.add_observer(weak, None)
    }

    /// Registers an observer for events concerning one channel.
    pub fn add_channel_observer<O: ClientObserver + 'static>(
        &self,
        channel_id: &ChannelId,
        observer: &Arc<O>,
    ) -> ObserverHandle {
        let weak: Weak<dyn ClientObserver> = Arc::downgrade(observer) as Weak<dyn ClientObserver>;
        self.dispatcher.add_observer(weak, Some(channel_id.clone()))
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> bool {
        self.dispatcher.remove_observer(handle)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.dispatcher.subscribe()
    }

    pub async fn load_channels(&self) -> CommandResult<Vec<ChannelSnapshot>> {
        self.submit(Command::LoadChannels, Responder::Channels).await
    }

    pub async fn channels(&self) -> Vec<ChannelSnapshot> {
        self.query(Query::Channels).await.unwrap_or_default()
    }

    pub async fn channel_by_id(&self, channel_id: &ChannelId) -> Option<ChannelSnapshot> {
        let channel_id = channel_id.clone();
        self.query(|tx| Query::ChannelById(channel_id, tx))
            .await
            .flatten()
    }

    pub async fn channel_by_unique_name(&self, unique_name: &str) -> Option<ChannelSnapshot> {
        let unique_name = unique_name.to_owned();
        self.query(|tx| Query::ChannelByUniqueName(unique_name, tx))
            .await
            .flatten()
    }

    pub async fn members(&self, channel_id: &ChannelId) -> Option<Vec<Member>> {
        let channel_id = channel_id.clone();
        self.query(|tx| Query::Members(channel_id, tx))
            .await
            .flatten()
    }

    pub async fn messages(&self, channel_id: &ChannelId) -> Option<Vec<Message>> {
        let channel_id = channel_id.clone();
        self.query(|tx| Query::Messages(channel_id, tx))
            .await
            .flatten()
    }

    pub async fn typing_members(&self, channel_id: &ChannelId) -> Vec<Identity> {
        let channel_id = channel_id.clone();
        self.query(|tx| Query::Typing(channel_id, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn session_state(&self) -> SessionState {
        self.query(Query::Session)
            .await
            .unwrap_or(SessionState::ShutDown)
    }

    pub async fn create_channel(&self, options: ChannelOptions) -> CommandResult<ChannelSnapshot> {
        if options.unique_name.as_deref().is_some_and(str::is_empty) {
            return Err(SyncError::validation("unique name must not be empty"));
        }
        self.submit(Command::CreateChannel(options), Responder::Channel)
            .await
    }

    pub async fn join_channel(&self, channel_id: &ChannelId) -> CommandResult<()> {
        self.change_status(channel_id, StatusChange::Join).await
    }

    pub async fn decline_invitation(&self, channel_id: &ChannelId) -> CommandResult<()> {
        self.change_status(channel_id, StatusChange::Decline).await
    }

    pub async fn leave_channel(&self, channel_id: &ChannelId) -> CommandResult<()> {
        self.change_status(channel_id, StatusChange::Leave).await
    }

    /// Evicts the channel once the server confirms.
    pub async fn destroy_channel(&self, channel_id: &ChannelId) -> CommandResult<()> {
        self.submit(Command::Destroy(channel_id.clone()), Responder::Unit)
            .await
    }

    pub async fn set_attributes(
        &self,
        channel_id: &ChannelId,
        attributes: Attributes,
    ) -> CommandResult<()> {
        self.submit(
            Command::SetAttributes(channel_id.clone(), attributes),
            Responder::Unit,
        )
        .await
    }

    pub async fn set_friendly_name(
        &self,
        channel_id: &ChannelId,
        friendly_name: impl Into<String>,
    ) -> CommandResult<()> {
        self.submit(
            Command::SetFriendlyName(channel_id.clone(), friendly_name.into()),
            Responder::Unit,
        )
        .await
    }

    pub async fn set_unique_name(
        &self,
        channel_id: &ChannelId,
        unique_name: impl Into<String>,
    ) -> CommandResult<()> {
        let unique_name = unique_name.into();
        if unique_name.is_empty() {
            return Err(SyncError::validation("unique name must not be empty"));
        }
        self.submit(
            Command::SetUniqueName(channel_id.clone(), unique_name),
            Responder::Unit,
        )
        .await
    }

    pub async fn add_member(&self, channel_id: &ChannelId, identity: Identity) -> CommandResult<()> {
        self.member(channel_id, identity, MemberOp::Add).await
    }

    pub async fn invite_member(
        &self,
        channel_id: &ChannelId,
        identity: Identity,
    ) -> CommandResult<()> {
        self.member(channel_id, identity, MemberOp::Invite).await
    }

    pub async fn remove_member(
        &self,
        channel_id: &ChannelId,
        identity: Identity,
    ) -> CommandResult<()> {
        self.member(channel_id, identity, MemberOp::Remove).await
    }

    /// Builds an unsent message authored by the session user. It joins a
    /// channel's log only once passed to [`SyncEngine::send_message`].
    pub fn create_message(&self, body: impl Into<String>) -> Message {
        Message::placeholder(self.identity.clone(), body.into())
    }

    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        message: &Message,
    ) -> CommandResult<Message> {
        if message.body.trim().is_empty() {
            return Err(SyncError::validation("message body must not be empty"));
        }
        self.submit(
            Command::SendMessage(channel_id.clone(), message.clone()),
            Responder::Message,
        )
        .await
    }

    pub async fn update_message_body(
        &self,
        channel_id: &ChannelId,
        message: &Message,
        body: impl Into<String>,
    ) -> CommandResult<Message> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(SyncError::validation("message body must not be empty"));
        }
        self.submit(
            Command::UpdateMessage(channel_id.clone(), message.local_id, body),
            Responder::Message,
        )
        .await
    }

    pub async fn remove_message(&self, channel_id: &ChannelId, message: &Message) -> CommandResult<()> {
        self.submit(
            Command::RemoveMessage(channel_id.clone(), message.local_id),
            Responder::Unit,
        )
        .await
    }

    /// Signals that the session user is typing. Repeated calls are throttled.
    pub fn typing(&self, channel_id: &ChannelId) {
        let _ = self.inbox.send(EngineInput::LocalTyping(channel_id.clone()));
    }

    /// Outcome arrives as `ToastSubscribed` or `ToastRegistrationFailed`.
    pub fn register_push_token(&self, token: &[u8]) {
        self.push_token(token, true);
    }

    pub fn deregister_push_token(&self, token: &[u8]) {
        self.push_token(token, false);
    }

    /// Feeds a notification delivered out of band, e.g. while the app was
    /// suspended.
    pub fn handle_inbound_notification(&self, payload: Value) {
        let _ = self.inbox.send(EngineInput::Push(payload));
    }

    /// Fails every outstanding command with `ShutDown` and waits for the
    /// transport to be released. Later commands fail with `Inactive`.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.inbox.send(EngineInput::Shutdown { done }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    async fn change_status(&self, channel_id: &ChannelId, change: StatusChange) -> CommandResult<()> {
        self.submit(
            Command::ChangeStatus(channel_id.clone(), change),
            Responder::Unit,
        )
        .await
    }

    async fn member(
        &self,
        channel_id: &ChannelId,
        identity: Identity,
        op: MemberOp,
    ) -> CommandResult<()> {
        self.submit(
            Command::Member(channel_id.clone(), identity, op),
            Responder::Unit,
        )
        .await
    }

    fn push_token(&self, token: &[u8], register: bool) {
        // Registration outcomes surface as events, so the result is not awaited.
        let (tx, _rx) = oneshot::channel();
        let command = Command::PushToken {
            token: token.to_vec(),
            register,
        };
        let _ = self.inbox.send(EngineInput::Command {
            command,
            responder: Responder::Unit(tx),
        });
    }

    async fn submit<T>(
        &self,
        command: Command,
        responder: fn(oneshot::Sender<CommandResult<T>>) -> Responder,
    ) -> CommandResult<T> {
        let (tx, rx) = oneshot::channel();
        let name = command.name();
        if self
            .inbox
            .send(EngineInput::Command {
                command,
                responder: responder(tx),
            })
            .is_err()
        {
            return Err(SyncError::Inactive);
        }
        rx.await.unwrap_or_else(|_| {
            debug!(command = name, "command: worker dropped the result sender");
            Err(SyncError::ShutDown)
        })
    }

    async fn query<T>(&self, query: impl FnOnce(oneshot::Sender<T>) -> Query) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(EngineInput::Query(query(tx))).ok()?;
        rx.await.ok()
    }
}
