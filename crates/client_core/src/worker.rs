use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use shared::{
    domain::{
        Attributes, ChannelId, ChannelStatus, DeliveryState, HistoryState, Identity, MessageId,
    },
    protocol::{
        ChannelRecord, ClientRequest, MemberRecord, MessageRecord, Revision, ServerEnvelope,
        ServerEvent, ServerReply,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    access::{AccessEvent, AccessManager},
    channel::{ChannelOptions, StatusChange},
    config::Settings,
    coordinator::{CommandCoordinator, CommandId, Outcome, Responder},
    correlator::{parse_push, CorrelationKey, NotificationCorrelator},
    dispatcher::EventDispatcher,
    engine::{Command, EngineInput, MemberOp, Query, SessionState},
    error::{CommandResult, SyncError},
    events::ClientEvent,
    members::MemberChange,
    messages::{Acknowledged, Message},
    registry::{ChannelRegistry, LoadStart, Upsert},
    transport::{request_with_retry, Transport},
    typing::{TypingExpiry, TypingTracker},
};

/// Where a transport reply goes once it comes back.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    Command(CommandId),
    Connect,
    UpdateToken,
    ChannelPage,
    Members(ChannelId),
    History(ChannelId),
    PushRegistration { register: bool },
    Typing(ChannelId),
}

/// A channel field edited ahead of confirmation, with the value proposed.
#[derive(Debug, Clone)]
enum FieldEdit {
    Status(ChannelStatus),
    Attributes(Attributes),
    FriendlyName(String),
    UniqueName(String),
}

impl FieldEdit {
    fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Attributes(_) => "attributes",
            Self::FriendlyName(_) => "friendly name",
            Self::UniqueName(_) => "unique name",
        }
    }
}

/// What to do with the reply of an outstanding command.
#[derive(Debug)]
enum Effect {
    LoadChannels,
    CreateChannel,
    Field {
        channel_id: ChannelId,
        edit: FieldEdit,
    },
    Destroy {
        channel_id: ChannelId,
    },
    Member {
        channel_id: ChannelId,
        identity: Identity,
        op: MemberOp,
    },
    Send {
        channel_id: ChannelId,
        local_id: Uuid,
    },
    UpdateMessage {
        channel_id: ChannelId,
    },
    RemoveMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

fn unknown_channel(channel_id: &ChannelId) -> SyncError {
    SyncError::NotFound(format!("channel {channel_id}"))
}

fn unexpected_reply(request: &str, reply: &ServerReply) -> SyncError {
    SyncError::Generic {
        code: 0,
        message: format!("unexpected reply to {request}: {reply:?}"),
    }
}

pub(crate) struct EngineWorker {
    settings: Settings,
    identity: Identity,
    access: Arc<dyn AccessManager>,
    transport: Arc<dyn Transport>,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
    dispatcher: EventDispatcher,
    session: SessionState,
    connected: bool,
    deferred: VecDeque<(Command, Responder)>,
    coordinator: CommandCoordinator<Effect>,
    registry: ChannelRegistry,
    correlator: NotificationCorrelator,
    typing: TypingTracker,
    last_typing_sent: HashMap<ChannelId, Instant>,
    listeners: Vec<JoinHandle<()>>,
}

impl EngineWorker {
    pub(crate) fn spawn(
        settings: Settings,
        access: Arc<dyn AccessManager>,
        transport: Arc<dyn Transport>,
        inbox: &mpsc::UnboundedSender<EngineInput>,
        dispatcher: EventDispatcher,
        rx: mpsc::UnboundedReceiver<EngineInput>,
    ) {
        let weak = inbox.downgrade();
        let expiry_inbox = weak.clone();
        let typing = TypingTracker::new(
            settings.typing_timeout(),
            Arc::new(move |expiry: TypingExpiry| {
                if let Some(tx) = expiry_inbox.upgrade() {
                    let _ = tx.send(EngineInput::TypingExpired(expiry));
                }
            }),
        );
        // Subscribe before connecting so no event published after connect is missed.
        let listeners = vec![
            forward(transport.subscribe_events(), weak.clone(), "transport", EngineInput::Server),
            forward(access.subscribe(), weak.clone(), "access", EngineInput::Access),
        ];

        let mut worker = Self {
            identity: access.identity(),
            correlator: NotificationCorrelator::new(settings.dedup_window),
            settings,
            access,
            transport,
            inbox: weak,
            dispatcher,
            session: SessionState::Connecting,
            connected: false,
            deferred: VecDeque::new(),
            coordinator: CommandCoordinator::new(),
            registry: ChannelRegistry::default(),
            typing,
            last_typing_sent: HashMap::new(),
            listeners,
        };
        worker.open_session();
        tokio::spawn(worker.run(rx));
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineInput>) {
        while let Some(input) = rx.recv().await {
            self.handle(input);
        }
        self.typing.shutdown();
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        debug!(identity = %self.identity, "engine: worker stopped");
    }

    fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Command { command, responder } => self.on_command(command, responder),
            EngineInput::Query(query) => self.on_query(query),
            EngineInput::Reply { route, result } => self.on_reply(route, result),
            EngineInput::Server(envelope) => self.on_server_event(envelope),
            EngineInput::Push(payload) => self.on_push(payload),
            EngineInput::Access(event) => self.on_access(event),
            EngineInput::TypingExpired(expiry) => self.on_typing_expired(expiry),
            EngineInput::LocalTyping(channel_id) => self.on_local_typing(channel_id),
            EngineInput::Shutdown { done } => self.on_shutdown(done),
        }
    }

    fn emit(&self, event: ClientEvent) {
        self.dispatcher.emit(event);
    }

    fn send_request(&self, request: ClientRequest, route: Route) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let timeout = self.settings.request_timeout();
        let attempts = self.settings.attempts();
        let retry_delay = self.settings.retry_delay();
        tokio::spawn(async move {
            let result =
                request_with_retry(transport.as_ref(), request, timeout, attempts, retry_delay)
                    .await;
            let _ = inbox.send(EngineInput::Reply { route, result });
        });
    }

    // ---- session lifecycle -------------------------------------------------

    fn open_session(&mut self) {
        if self.access.is_expired() {
            self.session = SessionState::Paused;
            info!(identity = %self.identity, "session: token already expired; waiting for refresh");
            return;
        }
        self.connect();
    }

    fn connect(&mut self) {
        self.session = SessionState::Connecting;
        info!(identity = %self.identity, "session: connecting");
        let request = ClientRequest::Connect {
            token: self.access.token(),
            identity: self.identity.clone(),
        };
        self.send_request(request, Route::Connect);
    }

    fn on_connected(&mut self, outcome: CommandResult<ServerReply>) {
        match self.session {
            SessionState::Connecting => {}
            // Expired mid-handshake: remember the session exists, stay paused.
            SessionState::Paused if outcome.is_ok() => {
                self.connected = true;
                return;
            }
            session => {
                debug!(?session, "session: ignoring stale connect reply");
                return;
            }
        }
        match outcome {
            Ok(_) => {
                self.connected = true;
                self.session = SessionState::Active;
                info!(identity = %self.identity, deferred = self.deferred.len(), "session: connected");
                self.replay_deferred();
            }
            Err(err) => {
                self.session = SessionState::Failed;
                error!(identity = %self.identity, "session: connect failed: {err}");
                for (_, responder) in self.deferred.drain(..) {
                    responder.fail(SyncError::Inactive);
                }
                self.emit(ClientEvent::Error(err));
            }
        }
    }

    fn on_token_forwarded(&mut self, outcome: CommandResult<ServerReply>) {
        match outcome {
            Ok(_) if self.session == SessionState::Paused => {
                self.session = SessionState::Active;
                info!(deferred = self.deferred.len(), "session: token refreshed; resuming");
                self.replay_deferred();
            }
            Ok(_) => {}
            Err(err) => {
                warn!("session: token update rejected: {err}");
                self.emit(ClientEvent::Error(err));
            }
        }
    }

    fn replay_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for (command, responder) in deferred {
            self.on_command(command, responder);
        }
    }

    fn on_access(&mut self, event: AccessEvent) {
        match event {
            AccessEvent::TokenExpired => {
                if matches!(self.session, SessionState::Active | SessionState::Connecting) {
                    self.session = SessionState::Paused;
                    info!(
                        outstanding = self.coordinator.len(),
                        "session: token expired; deferring new commands"
                    );
                }
            }
            AccessEvent::TokenUpdated { token } => match self.session {
                SessionState::ShutDown => {}
                SessionState::Failed => self.connect(),
                SessionState::Paused if !self.connected => self.connect(),
                SessionState::Paused | SessionState::Active => {
                    self.send_request(ClientRequest::UpdateToken { token }, Route::UpdateToken)
                }
                // The in-flight connect already carries a token; the next refresh will follow it.
                SessionState::Connecting => {}
            },
            AccessEvent::Error(message) => {
                warn!("session: access manager error: {message}");
                self.emit(ClientEvent::Error(SyncError::PermissionDenied(message)));
            }
        }
    }

    fn on_shutdown(&mut self, done: oneshot::Sender<()>) {
        if self.session == SessionState::ShutDown {
            let _ = done.send(());
            return;
        }
        self.session = SessionState::ShutDown;
        for (_, responder) in self.deferred.drain(..) {
            responder.fail(SyncError::ShutDown);
        }
        let _ = self.registry.finish_load(false);
        let failed = self.coordinator.fail_all(&SyncError::ShutDown);
        self.typing.shutdown();
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        info!(identity = %self.identity, failed, "engine: shut down");

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.shutdown().await;
            let _ = done.send(());
        });
    }

    // ---- commands ----------------------------------------------------------

    fn on_command(&mut self, command: Command, responder: Responder) {
        match self.session {
            SessionState::Active => self.execute(command, responder),
            SessionState::Connecting | SessionState::Paused => {
                debug!(command = command.name(), session = ?self.session, "command: deferred");
                self.deferred.push_back((command, responder));
            }
            SessionState::Failed | SessionState::ShutDown => responder.fail(SyncError::Inactive),
        }
    }

    fn execute(&mut self, command: Command, responder: Responder) {
        match command {
            Command::LoadChannels => self.load_channels(responder),
            Command::CreateChannel(options) => self.create_channel(options, responder),
            Command::ChangeStatus(channel_id, change) => {
                self.change_status(channel_id, change, responder)
            }
            Command::Destroy(channel_id) => {
                if self.registry.get(&channel_id).is_none() {
                    return responder.fail(unknown_channel(&channel_id));
                }
                let id = self.coordinator.register(
                    "destroy_channel",
                    responder,
                    Effect::Destroy {
                        channel_id: channel_id.clone(),
                    },
                );
                self.send_request(
                    ClientRequest::DestroyChannel { channel_id },
                    Route::Command(id),
                );
            }
            Command::SetAttributes(channel_id, attributes) => {
                let request = ClientRequest::SetAttributes {
                    channel_id: channel_id.clone(),
                    attributes: attributes.clone(),
                };
                self.edit_field(channel_id, FieldEdit::Attributes(attributes), request, responder)
            }
            Command::SetFriendlyName(channel_id, friendly_name) => {
                let request = ClientRequest::SetFriendlyName {
                    channel_id: channel_id.clone(),
                    friendly_name: friendly_name.clone(),
                };
                self.edit_field(
                    channel_id,
                    FieldEdit::FriendlyName(friendly_name),
                    request,
                    responder,
                )
            }
            Command::SetUniqueName(channel_id, unique_name) => {
                let request = ClientRequest::SetUniqueName {
                    channel_id: channel_id.clone(),
                    unique_name: unique_name.clone(),
                };
                self.edit_field(
                    channel_id,
                    FieldEdit::UniqueName(unique_name),
                    request,
                    responder,
                )
            }
            Command::Member(channel_id, identity, op) => {
                if self.registry.get(&channel_id).is_none() {
                    return responder.fail(unknown_channel(&channel_id));
                }
                let request = match op {
                    MemberOp::Add => ClientRequest::AddMember {
                        channel_id: channel_id.clone(),
                        identity: identity.clone(),
                    },
                    MemberOp::Invite => ClientRequest::InviteMember {
                        channel_id: channel_id.clone(),
                        identity: identity.clone(),
                    },
                    MemberOp::Remove => ClientRequest::RemoveMember {
                        channel_id: channel_id.clone(),
                        identity: identity.clone(),
                    },
                };
                let id = self.coordinator.register(
                    request.name(),
                    responder,
                    Effect::Member {
                        channel_id,
                        identity,
                        op,
                    },
                );
                self.send_request(request, Route::Command(id));
            }
            Command::SendMessage(channel_id, message) => {
                self.send_message(channel_id, message, responder)
            }
            Command::UpdateMessage(channel_id, local_id, body) => {
                self.update_message(channel_id, local_id, body, responder)
            }
            Command::RemoveMessage(channel_id, local_id) => {
                self.remove_message(channel_id, local_id, responder)
            }
            Command::PushToken { token, register } => {
                let token_b64 = STANDARD.encode(token);
                let request = if register {
                    ClientRequest::RegisterPushToken { token_b64 }
                } else {
                    ClientRequest::DeregisterPushToken { token_b64 }
                };
                self.send_request(request, Route::PushRegistration { register });
                responder.resolve(Ok(Outcome::Done));
            }
        }
    }

    fn load_channels(&mut self, responder: Responder) {
        let id = self
            .coordinator
            .register("load_channels", responder, Effect::LoadChannels);
        match self.registry.begin_load(id) {
            LoadStart::Started => {
                info!("registry: loading channel list");
                self.send_request(
                    ClientRequest::ListChannels { cursor: None },
                    Route::ChannelPage,
                );
            }
            LoadStart::Attached => debug!(command_id = id, "registry: joined in-flight load"),
            LoadStart::AlreadyComplete => {
                let channels = self.registry.all_loaded_so_far();
                self.coordinator.complete(id, Ok(Outcome::Channels(channels)));
            }
        }
    }

    fn create_channel(&mut self, options: ChannelOptions, responder: Responder) {
        if let Some(unique_name) = &options.unique_name {
            if self.registry.by_unique_name(unique_name).is_some() {
                return responder.fail(SyncError::NameConflict(unique_name.clone()));
            }
        }
        let id = self
            .coordinator
            .register("create_channel", responder, Effect::CreateChannel);
        self.send_request(options.into_request(), Route::Command(id));
    }

    fn change_status(&mut self, channel_id: ChannelId, change: StatusChange, responder: Responder) {
        let Some(channel) = self.registry.get(&channel_id) else {
            return responder.fail(unknown_channel(&channel_id));
        };
        let target = match channel.target_status(change) {
            Ok(target) => target,
            Err(err) => return responder.fail(err),
        };
        let request = change.request(channel_id.clone());
        self.edit_field(channel_id, FieldEdit::Status(target), request, responder);
    }

    /// Registers the command, shows the edit locally, then sends the request.
    fn edit_field(
        &mut self,
        channel_id: ChannelId,
        edit: FieldEdit,
        request: ClientRequest,
        responder: Responder,
    ) {
        if self.registry.get(&channel_id).is_none() {
            return responder.fail(unknown_channel(&channel_id));
        }
        let id = self.coordinator.register(
            request.name(),
            responder,
            Effect::Field {
                channel_id: channel_id.clone(),
                edit: edit.clone(),
            },
        );
        let proposed = match edit {
            FieldEdit::UniqueName(unique_name) => {
                self.registry
                    .propose_unique_name(&channel_id, id, unique_name)
            }
            edit => {
                if let Some(channel) = self.registry.get_mut(&channel_id) {
                    match edit {
                        FieldEdit::Status(status) => channel.status.propose(id, status),
                        FieldEdit::Attributes(attributes) => channel.attributes.propose(id, attributes),
                        FieldEdit::FriendlyName(name) => channel.friendly_name.propose(id, Some(name)),
                        FieldEdit::UniqueName(_) => {}
                    }
                }
                Ok(())
            }
        };
        match proposed {
            Ok(()) => self.send_request(request, Route::Command(id)),
            Err(err) => {
                self.coordinator.complete(id, Err(err));
            }
        }
    }

    fn send_message(&mut self, channel_id: ChannelId, message: Message, responder: Responder) {
        let Some(channel) = self.registry.get_mut(&channel_id) else {
            return responder.fail(unknown_channel(&channel_id));
        };
        let staged = match channel.messages.stage(&message) {
            Ok(staged) => staged,
            Err(err) => return responder.fail(err),
        };
        let id = self.coordinator.register(
            "send_message",
            responder,
            Effect::Send {
                channel_id: channel_id.clone(),
                local_id: staged.local_id,
            },
        );
        let request = ClientRequest::SendMessage {
            channel_id,
            body: staged.body,
            nonce: staged.local_id.to_string(),
        };
        self.send_request(request, Route::Command(id));
    }

    fn update_message(
        &mut self,
        channel_id: ChannelId,
        local_id: Uuid,
        body: String,
        responder: Responder,
    ) {
        let Some(channel) = self.registry.get(&channel_id) else {
            return responder.fail(unknown_channel(&channel_id));
        };
        let Some(message) = channel.messages.get_local(local_id) else {
            return responder.fail(SyncError::NotFound(format!("message {local_id}")));
        };
        let Some(message_id) = message.message_id.clone() else {
            return responder.fail(SyncError::validation("message has not been sent"));
        };
        let id = self.coordinator.register(
            "update_message",
            responder,
            Effect::UpdateMessage {
                channel_id: channel_id.clone(),
            },
        );
        let request = ClientRequest::UpdateMessage {
            channel_id,
            message_id,
            body,
        };
        self.send_request(request, Route::Command(id));
    }

    fn remove_message(&mut self, channel_id: ChannelId, local_id: Uuid, responder: Responder) {
        let Some(channel) = self.registry.get_mut(&channel_id) else {
            return responder.fail(unknown_channel(&channel_id));
        };
        let Some(message) = channel.messages.get_local(local_id) else {
            return responder.fail(SyncError::NotFound(format!("message {local_id}")));
        };
        match (message.message_id.clone(), message.state) {
            (Some(message_id), _) => {
                let id = self.coordinator.register(
                    "remove_message",
                    responder,
                    Effect::RemoveMessage {
                        channel_id: channel_id.clone(),
                        message_id: message_id.clone(),
                    },
                );
                self.send_request(
                    ClientRequest::RemoveMessage {
                        channel_id,
                        message_id,
                    },
                    Route::Command(id),
                );
            }
            (None, DeliveryState::Failed) => {
                // Never acknowledged, so the server has nothing to remove.
                channel.messages.discard_local(local_id);
                debug!(channel_id = %channel_id, %local_id, "messages: discarded failed placeholder");
                responder.resolve(Ok(Outcome::Done));
            }
            (None, _) => responder.fail(SyncError::validation("message is still being sent")),
        }
    }

    // ---- replies -----------------------------------------------------------

    fn on_reply(&mut self, route: Route, result: anyhow::Result<ServerReply>) {
        if self.session == SessionState::ShutDown {
            debug!(?route, "engine: ignoring reply after shutdown");
            return;
        }
        let outcome = match result {
            Ok(ServerReply::Error(error)) => Err(SyncError::from(error)),
            Ok(reply) => Ok(reply),
            Err(err) => Err(SyncError::network(&err)),
        };
        match route {
            Route::Command(id) => self.on_command_reply(id, outcome),
            Route::Connect => self.on_connected(outcome),
            Route::UpdateToken => self.on_token_forwarded(outcome),
            Route::ChannelPage => self.on_channel_page(outcome),
            Route::Members(channel_id) => self.on_members(channel_id, outcome),
            Route::History(channel_id) => self.on_history_page(channel_id, outcome),
            Route::PushRegistration { register } => self.on_push_registration(register, outcome),
            Route::Typing(channel_id) => {
                if let Err(err) = outcome {
                    debug!(channel_id = %channel_id, "typing: signal not delivered: {err}");
                }
            }
        }
    }

    fn on_command_reply(&mut self, id: CommandId, outcome: CommandResult<ServerReply>) {
        let name = self.coordinator.name(id).unwrap_or("command");
        let Some((responder, effect)) = self.coordinator.take(id) else {
            debug!(command_id = id, "command: ignoring reply for completed command");
            return;
        };
        let result = self.settle(id, effect, outcome);
        if let Err(err) = &result {
            debug!(command_id = id, command = name, "command: failed: {err}");
        }
        responder.resolve(result);
    }

    fn settle(
        &mut self,
        id: CommandId,
        effect: Effect,
        outcome: CommandResult<ServerReply>,
    ) -> CommandResult<Outcome> {
        match effect {
            Effect::LoadChannels => Ok(Outcome::Channels(self.registry.all_loaded_so_far())),
            Effect::CreateChannel => match outcome? {
                ServerReply::Channel { channel } => {
                    let channel_id = channel.channel_id.clone();
                    self.apply_channel_record(channel);
                    self.registry
                        .get(&channel_id)
                        .map(|channel| Outcome::Channel(channel.snapshot()))
                        .ok_or_else(|| unknown_channel(&channel_id))
                }
                other => Err(unexpected_reply("create_channel", &other)),
            },
            Effect::Field { channel_id, edit } => self.settle_field(id, channel_id, edit, outcome),
            Effect::Destroy { channel_id } => match outcome {
                Ok(_) | Err(SyncError::NotFound(_)) => {
                    self.evict_channel(&channel_id);
                    Ok(Outcome::Done)
                }
                Err(err) => Err(err),
            },
            Effect::Member {
                channel_id,
                identity,
                op,
            } => self.settle_member(channel_id, identity, op, outcome),
            Effect::Send {
                channel_id,
                local_id,
            } => self.settle_send(channel_id, local_id, outcome),
            Effect::UpdateMessage { channel_id } => match outcome? {
                ServerReply::Message { message } => {
                    let Some(channel) = self.registry.get_mut(&channel_id) else {
                        return Ok(Outcome::Message(Message::from_record(message, Uuid::new_v4())));
                    };
                    let message_id = message.message_id.clone();
                    if let Some(edited) = channel.messages.apply_edit(message.clone()) {
                        self.dispatcher.emit(ClientEvent::MessageChanged {
                            channel_id,
                            message: edited.clone(),
                        });
                        return Ok(Outcome::Message(edited));
                    }
                    let current = channel
                        .messages
                        .get_by_id(&message_id)
                        .cloned()
                        .unwrap_or_else(|| Message::from_record(message, Uuid::new_v4()));
                    Ok(Outcome::Message(current))
                }
                other => Err(unexpected_reply("update_message", &other)),
            },
            Effect::RemoveMessage {
                channel_id,
                message_id,
            } => match outcome {
                Ok(_) | Err(SyncError::NotFound(_)) => {
                    self.drop_message(&channel_id, &message_id);
                    Ok(Outcome::Done)
                }
                Err(err) => Err(err),
            },
        }
    }

    fn settle_field(
        &mut self,
        id: CommandId,
        channel_id: ChannelId,
        edit: FieldEdit,
        outcome: CommandResult<ServerReply>,
    ) -> CommandResult<Outcome> {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                self.withdraw_edit(&channel_id, id, &edit);
                warn!(
                    channel_id = %channel_id,
                    command_id = id,
                    "channel: {} change rolled back: {err}",
                    edit.name()
                );
                return Err(err);
            }
        };

        // The server's value wins; an Ack confirms what was proposed.
        let record: Option<ChannelRecord> = match reply {
            ServerReply::Channel { channel } => Some(channel),
            _ => None,
        };
        let superseded = match (&record, self.registry.get_mut(&channel_id)) {
            (Some(record), Some(channel)) if !channel.accepts(record.revision) => true,
            (Some(record), Some(channel)) => {
                channel.note_revision(record.revision);
                false
            }
            _ => false,
        };
        if superseded {
            // A newer server state already landed; only the pending edit goes.
            debug!(
                channel_id = %channel_id,
                command_id = id,
                "channel: {} reply predates applied state",
                edit.name()
            );
            self.withdraw_edit(&channel_id, id, &edit);
            return Ok(Outcome::Done);
        }
        match edit {
            FieldEdit::UniqueName(proposed) => {
                let confirmed = record.map_or(Some(proposed), |r| r.unique_name);
                let _ = self.registry.confirm_unique_name(&channel_id, id, confirmed);
            }
            edit => {
                if let Some(channel) = self.registry.get_mut(&channel_id) {
                    match edit {
                        FieldEdit::Status(proposed) => channel
                            .status
                            .confirm(id, record.map_or(proposed, |r| r.status)),
                        FieldEdit::Attributes(proposed) => channel
                            .attributes
                            .confirm(id, record.map_or(proposed, |r| r.attributes)),
                        FieldEdit::FriendlyName(proposed) => channel
                            .friendly_name
                            .confirm(id, record.map_or(Some(proposed), |r| r.friendly_name)),
                        FieldEdit::UniqueName(_) => {}
                    }
                }
            }
        }
        self.publish_channel_change(&channel_id);
        self.publish_displaced();
        self.sync_channel_if_joined(&channel_id);
        Ok(Outcome::Done)
    }

    /// Drops a pending edit; the field falls back to the newest edit still
    /// pending, or to the confirmed value.
    fn withdraw_edit(&mut self, channel_id: &ChannelId, id: CommandId, edit: &FieldEdit) {
        if let FieldEdit::UniqueName(_) = edit {
            let _ = self.registry.reject_unique_name(channel_id, id);
            return;
        }
        let Some(channel) = self.registry.get_mut(channel_id) else {
            return;
        };
        match edit {
            FieldEdit::Status(_) => channel.status.reject(id),
            FieldEdit::Attributes(_) => channel.attributes.reject(id),
            FieldEdit::FriendlyName(_) => channel.friendly_name.reject(id),
            FieldEdit::UniqueName(_) => {}
        }
    }

    fn settle_member(
        &mut self,
        channel_id: ChannelId,
        identity: Identity,
        op: MemberOp,
        outcome: CommandResult<ServerReply>,
    ) -> CommandResult<Outcome> {
        match (op, outcome) {
            (MemberOp::Remove, Ok(reply)) => {
                let revision = match reply {
                    ServerReply::Removed { revision } => revision,
                    _ => 0,
                };
                self.evict_member(&channel_id, &identity, revision);
                Ok(Outcome::Done)
            }
            (MemberOp::Remove, Err(SyncError::NotFound(_))) => {
                self.evict_member(&channel_id, &identity, 0);
                Ok(Outcome::Done)
            }
            (MemberOp::Add | MemberOp::Invite, Ok(reply)) => {
                let Some(channel) = self.registry.get_mut(&channel_id) else {
                    return Ok(Outcome::Done);
                };
                let change = match (reply, op) {
                    (ServerReply::Member { member }, _) => channel.members.apply(member),
                    (_, MemberOp::Add) => channel.members.add(identity),
                    _ => channel.members.invite(identity),
                };
                self.publish_member_change(&channel_id, change);
                Ok(Outcome::Done)
            }
            (_, Err(err)) => Err(err),
        }
    }

    fn settle_send(
        &mut self,
        channel_id: ChannelId,
        local_id: Uuid,
        outcome: CommandResult<ServerReply>,
    ) -> CommandResult<Outcome> {
        let record = match outcome {
            Ok(ServerReply::Message { message }) => message,
            Ok(other) => {
                let err = unexpected_reply("send_message", &other);
                if let Some(channel) = self.registry.get_mut(&channel_id) {
                    channel.messages.mark_failed(local_id);
                }
                return Err(err);
            }
            Err(err) => {
                if let Some(channel) = self.registry.get_mut(&channel_id) {
                    channel.messages.mark_failed(local_id);
                }
                warn!(channel_id = %channel_id, %local_id, "messages: send failed: {err}");
                return Err(err);
            }
        };

        self.correlator.record(CorrelationKey::MessageAdded(
            channel_id.clone(),
            record.message_id.clone(),
        ));
        let Some(channel) = self.registry.get_mut(&channel_id) else {
            return Ok(Outcome::Message(Message::from_record(record, local_id)));
        };
        match channel.messages.acknowledge(local_id, record) {
            Acknowledged::Added(message) => {
                self.dispatcher.emit(ClientEvent::MessageAdded {
                    channel_id,
                    message: message.clone(),
                });
                Ok(Outcome::Message(message))
            }
            Acknowledged::Merged(message) => Ok(Outcome::Message(message)),
        }
    }

    fn on_channel_page(&mut self, outcome: CommandResult<ServerReply>) {
        match outcome {
            Ok(ServerReply::ChannelPage {
                channels,
                next_cursor,
            }) => {
                for record in channels {
                    self.apply_channel_record(record);
                }
                match next_cursor {
                    Some(cursor) => self.send_request(
                        ClientRequest::ListChannels {
                            cursor: Some(cursor),
                        },
                        Route::ChannelPage,
                    ),
                    None => {
                        let channels = self.registry.all_loaded_so_far();
                        info!(count = channels.len(), "registry: channel list synchronized");
                        for id in self.registry.finish_load(true) {
                            self.coordinator
                                .complete(id, Ok(Outcome::Channels(channels.clone())));
                        }
                    }
                }
            }
            Ok(other) => self.fail_load(unexpected_reply("list_channels", &other)),
            Err(err) => self.fail_load(err),
        }
    }

    fn fail_load(&mut self, err: SyncError) {
        warn!("registry: channel list load failed: {err}");
        for id in self.registry.finish_load(false) {
            self.coordinator.complete(id, Err(err.clone()));
        }
    }

    fn on_members(&mut self, channel_id: ChannelId, outcome: CommandResult<ServerReply>) {
        let members = match outcome {
            Ok(ServerReply::Members { members }) => members,
            Ok(other) => {
                return self.emit(ClientEvent::Error(unexpected_reply("list_members", &other)))
            }
            Err(err) => {
                warn!(channel_id = %channel_id, "members: sync failed: {err}");
                return self.emit(ClientEvent::Error(err));
            }
        };
        let Some(channel) = self.registry.get_mut(&channel_id) else {
            return;
        };
        let changes = channel.members.merge(members);
        debug!(channel_id = %channel_id, members = channel.members.len(), "members: synchronized");
        for change in changes {
            self.publish_member_change(&channel_id, change);
        }
    }

    fn on_history_page(&mut self, channel_id: ChannelId, outcome: CommandResult<ServerReply>) {
        let Some(channel) = self.registry.get_mut(&channel_id) else {
            return;
        };
        let (messages, complete) = match outcome {
            Ok(ServerReply::MessagePage { messages, complete }) => (messages, complete),
            Ok(other) => {
                channel.history = HistoryState::NotStarted;
                return self.emit(ClientEvent::Error(unexpected_reply("fetch_messages", &other)));
            }
            Err(err) => {
                channel.history = HistoryState::NotStarted;
                warn!(channel_id = %channel_id, "messages: history fetch failed: {err}");
                return self.emit(ClientEvent::Error(err));
            }
        };

        let oldest = messages
            .iter()
            .min_by_key(|m| m.created_at)
            .map(|m| m.message_id.clone());
        let mut keys = Vec::with_capacity(messages.len());
        for record in messages {
            keys.push(CorrelationKey::MessageAdded(
                channel_id.clone(),
                record.message_id.clone(),
            ));
            channel.messages.apply_add(record);
        }

        match oldest {
            Some(before) if !complete => {
                channel.history_cursor = Some(before.clone());
                self.correlator.record_all(keys);
                self.send_request(
                    ClientRequest::FetchMessages {
                        channel_id: channel_id.clone(),
                        before: Some(before),
                        limit: self.settings.history_page_size,
                    },
                    Route::History(channel_id),
                );
            }
            _ => {
                channel.history = HistoryState::Complete;
                channel.history_cursor = None;
                let snapshot = channel.snapshot();
                info!(
                    channel_id = %channel_id,
                    messages = channel.messages.len(),
                    "messages: history loaded"
                );
                self.correlator.record_all(keys);
                self.emit(ClientEvent::ChannelHistoryLoaded(snapshot));
            }
        }
    }

    fn on_push_registration(&mut self, register: bool, outcome: CommandResult<ServerReply>) {
        match (register, outcome) {
            (true, Ok(_)) => {
                info!("push: registered for notifications");
                self.emit(ClientEvent::ToastSubscribed);
            }
            (true, Err(err)) => {
                warn!("push: registration failed: {err}");
                self.emit(ClientEvent::ToastRegistrationFailed(err));
            }
            (false, Ok(_)) => info!("push: deregistered from notifications"),
            (false, Err(err)) => {
                warn!("push: deregistration failed: {err}");
                self.emit(ClientEvent::Error(err));
            }
        }
    }

    // ---- inbound events ----------------------------------------------------

    fn on_server_event(&mut self, envelope: ServerEnvelope) {
        if self.session == SessionState::ShutDown {
            return;
        }
        let keys = NotificationCorrelator::keys_for(&envelope);
        if self.correlator.is_duplicate(&keys) {
            debug!(event_id = ?envelope.event_id, "correlator: dropping duplicate delivery");
            return;
        }
        self.apply_server_event(envelope.event);
        self.correlator.record_all(keys);
    }

    fn apply_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ChannelAdded { channel } | ServerEvent::ChannelUpdated { channel } => {
                self.apply_channel_record(channel)
            }
            ServerEvent::ChannelDeleted { channel_id } => self.evict_channel(&channel_id),
            ServerEvent::MemberJoined { channel_id, member }
            | ServerEvent::MemberUpdated { channel_id, member } => {
                self.apply_member(&channel_id, member)
            }
            ServerEvent::MemberLeft {
                channel_id,
                identity,
                revision,
            } => self.evict_member(&channel_id, &identity, revision),
            ServerEvent::MessageAdded {
                channel_id,
                message,
            } => {
                self.apply_incoming_message(&channel_id, message);
            }
            ServerEvent::MessageUpdated {
                channel_id,
                message,
            } => {
                let edited = self
                    .registry
                    .get_mut(&channel_id)
                    .and_then(|channel| channel.messages.apply_edit(message));
                if let Some(message) = edited {
                    self.emit(ClientEvent::MessageChanged {
                        channel_id,
                        message,
                    });
                }
            }
            ServerEvent::MessageRemoved {
                channel_id,
                message_id,
            } => self.drop_message(&channel_id, &message_id),
            ServerEvent::TypingStarted {
                channel_id,
                identity,
            } => {
                if identity == self.identity || self.registry.get(&channel_id).is_none() {
                    return;
                }
                if self.typing.begin(&channel_id, &identity) {
                    self.emit(ClientEvent::TypingStarted {
                        channel_id,
                        identity,
                    });
                }
            }
            ServerEvent::TypingEnded {
                channel_id,
                identity,
            } => {
                if self.typing.end(&channel_id, &identity) {
                    self.emit(ClientEvent::TypingEnded {
                        channel_id,
                        identity,
                    });
                }
            }
            ServerEvent::TransportFault { error } => {
                let err = SyncError::from(error);
                warn!("transport: fault reported: {err}");
                self.emit(ClientEvent::Error(err));
            }
        }
    }

    fn on_push(&mut self, payload: Value) {
        if self.session == SessionState::ShutDown {
            return;
        }
        let push = match parse_push(payload) {
            Ok(push) => push,
            Err(err) => {
                warn!("push: dropping payload: {err}");
                return;
            }
        };
        let key = CorrelationKey::MessageAdded(push.channel_id.clone(), push.message_id.clone());
        if self.correlator.is_duplicate(std::slice::from_ref(&key)) {
            debug!(message_id = %push.message_id, "push: already delivered by transport");
            return;
        }
        let Some(channel) = self.registry.get(&push.channel_id) else {
            warn!(channel_id = %push.channel_id, "push: dropping payload for unknown channel");
            return;
        };
        if channel.messages.contains_id(&push.message_id) {
            debug!(message_id = %push.message_id, "push: message already in log");
            return;
        }

        let message = match push.message_record() {
            Some(record) => {
                let applied = self.apply_incoming_message(&push.channel_id, record);
                if applied.is_some() {
                    self.correlator.record(key);
                }
                applied
            }
            None => None,
        };
        self.emit(ClientEvent::ToastReceived {
            channel_id: push.channel_id,
            message_id: push.message_id,
            message,
        });
    }

    fn on_typing_expired(&mut self, expiry: TypingExpiry) {
        if self.typing.expire(&expiry) {
            self.emit(ClientEvent::TypingEnded {
                channel_id: expiry.channel_id,
                identity: expiry.identity,
            });
        }
    }

    fn on_local_typing(&mut self, channel_id: ChannelId) {
        if self.session != SessionState::Active || self.registry.get(&channel_id).is_none() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_typing_sent.get(&channel_id) {
            if now.duration_since(*last) < self.settings.typing_send_interval() {
                return;
            }
        }
        self.last_typing_sent.insert(channel_id.clone(), now);
        self.send_request(
            ClientRequest::Typing {
                channel_id: channel_id.clone(),
            },
            Route::Typing(channel_id),
        );
    }

    fn on_query(&self, query: Query) {
        match query {
            Query::Channels(tx) => {
                let _ = tx.send(self.registry.all_loaded_so_far());
            }
            Query::ChannelById(channel_id, tx) => {
                let _ = tx.send(self.registry.get(&channel_id).map(|c| c.snapshot()));
            }
            Query::ChannelByUniqueName(unique_name, tx) => {
                let _ = tx.send(self.registry.by_unique_name(&unique_name).map(|c| c.snapshot()));
            }
            Query::Members(channel_id, tx) => {
                let _ = tx.send(self.registry.get(&channel_id).map(|c| c.members.all()));
            }
            Query::Messages(channel_id, tx) => {
                let _ = tx.send(self.registry.get(&channel_id).map(|c| c.messages.all()));
            }
            Query::Typing(channel_id, tx) => {
                let _ = tx.send(self.typing.typing_in(&channel_id));
            }
            Query::Session(tx) => {
                let _ = tx.send(self.session);
            }
        }
    }

    // ---- state helpers -----------------------------------------------------

    fn apply_channel_record(&mut self, record: ChannelRecord) {
        let channel_id = record.channel_id.clone();
        match self.registry.upsert(record) {
            Upsert::Added(snapshot) => {
                debug!(channel_id = %channel_id, "registry: channel added");
                self.emit(ClientEvent::ChannelAdded(snapshot));
            }
            Upsert::Changed(snapshot) => self.emit(ClientEvent::ChannelChanged(snapshot)),
            Upsert::Unchanged => {}
        }
        self.publish_displaced();
        self.sync_channel_if_joined(&channel_id);
    }

    fn publish_channel_change(&mut self, channel_id: &ChannelId) {
        if let Some(snapshot) = self
            .registry
            .get_mut(channel_id)
            .and_then(|channel| channel.take_change())
        {
            self.emit(ClientEvent::ChannelChanged(snapshot));
        }
    }

    fn publish_displaced(&mut self) {
        for channel_id in self.registry.take_displaced() {
            self.publish_channel_change(&channel_id);
        }
    }

    /// Pulls members and history the first time a channel is seen as joined.
    fn sync_channel_if_joined(&mut self, channel_id: &ChannelId) {
        if !self.settings.auto_sync_joined_channels {
            return;
        }
        let Some(channel) = self.registry.get_mut(channel_id) else {
            return;
        };
        if !channel.is_joined() || channel.history != HistoryState::NotStarted {
            return;
        }
        channel.history = HistoryState::Loading;
        channel.history_cursor = None;
        debug!(channel_id = %channel_id, "registry: synchronizing joined channel");
        self.send_request(
            ClientRequest::ListMembers {
                channel_id: channel_id.clone(),
            },
            Route::Members(channel_id.clone()),
        );
        self.send_request(
            ClientRequest::FetchMessages {
                channel_id: channel_id.clone(),
                before: None,
                limit: self.settings.history_page_size,
            },
            Route::History(channel_id.clone()),
        );
    }

    fn evict_channel(&mut self, channel_id: &ChannelId) {
        let Some(channel) = self.registry.remove(channel_id) else {
            return;
        };
        // Indicators vanish with the channel; no typingEnded follows its deletion.
        self.typing.clear_channel(channel_id);
        self.last_typing_sent.remove(channel_id);
        info!(channel_id = %channel_id, "registry: channel removed");
        self.emit(ClientEvent::ChannelDeleted(channel.snapshot()));
    }

    fn apply_member(&mut self, channel_id: &ChannelId, member: MemberRecord) {
        let Some(channel) = self.registry.get_mut(channel_id) else {
            debug!(channel_id = %channel_id, "members: ignoring change for unknown channel");
            return;
        };
        let change = channel.members.apply(member);
        self.publish_member_change(channel_id, change);
    }

    fn publish_member_change(&self, channel_id: &ChannelId, change: MemberChange) {
        let channel_id = channel_id.clone();
        match change {
            MemberChange::Joined(member) => self.emit(ClientEvent::MemberJoined { channel_id, member }),
            MemberChange::Changed(member) => {
                self.emit(ClientEvent::MemberChanged { channel_id, member })
            }
            MemberChange::Unchanged => {}
        }
    }

    fn evict_member(&mut self, channel_id: &ChannelId, identity: &Identity, revision: Revision) {
        let Some(member) = self
            .registry
            .get_mut(channel_id)
            .and_then(|channel| channel.members.remove(identity, revision))
        else {
            return;
        };
        if self.typing.end(channel_id, identity) {
            self.emit(ClientEvent::TypingEnded {
                channel_id: channel_id.clone(),
                identity: identity.clone(),
            });
        }
        self.emit(ClientEvent::MemberLeft {
            channel_id: channel_id.clone(),
            member,
        });
    }

    fn apply_incoming_message(
        &mut self,
        channel_id: &ChannelId,
        record: MessageRecord,
    ) -> Option<Message> {
        let Some(channel) = self.registry.get_mut(channel_id) else {
            debug!(channel_id = %channel_id, "messages: ignoring message for unknown channel");
            return None;
        };
        let author = record.author.clone();
        let message = channel.messages.apply_add(record)?;
        self.emit(ClientEvent::MessageAdded {
            channel_id: channel_id.clone(),
            message: message.clone(),
        });
        if self.typing.end(channel_id, &author) {
            self.emit(ClientEvent::TypingEnded {
                channel_id: channel_id.clone(),
                identity: author,
            });
        }
        Some(message)
    }

    fn drop_message(&mut self, channel_id: &ChannelId, message_id: &MessageId) {
        self.correlator.record(CorrelationKey::MessageRemoved(
            channel_id.clone(),
            message_id.clone(),
        ));
        let removed = self
            .registry
            .get_mut(channel_id)
            .and_then(|channel| channel.messages.remove_by_id(message_id));
        if let Some(message) = removed {
            self.emit(ClientEvent::MessageDeleted {
                channel_id: channel_id.clone(),
                message,
            });
        }
    }
}

/// Relays a broadcast stream into the worker queue until either side closes.
fn forward<T, F>(
    mut rx: broadcast::Receiver<T>,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
    source: &'static str,
    wrap: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> EngineInput + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let Some(tx) = inbox.upgrade() else {
                        break;
                    };
                    if tx.send(wrap(item)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "{source}: event stream lagged; some events were lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
