use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::{
    channel::ChannelSnapshot,
    error::{CommandResult, SyncError},
    messages::Message,
};

pub(crate) type CommandId = u64;

/// The single-shot result sender of one command, typed by what the caller expects back.
#[derive(Debug)]
pub(crate) enum Responder {
    Unit(oneshot::Sender<CommandResult<()>>),
    Channel(oneshot::Sender<CommandResult<ChannelSnapshot>>),
    Channels(oneshot::Sender<CommandResult<Vec<ChannelSnapshot>>>),
    Message(oneshot::Sender<CommandResult<Message>>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Done,
    Channel(ChannelSnapshot),
    Channels(Vec<ChannelSnapshot>),
    Message(Message),
}

impl Outcome {
    fn name(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Channel(_) => "channel",
            Self::Channels(_) => "channels",
            Self::Message(_) => "message",
        }
    }
}

impl Responder {
    pub(crate) fn resolve(self, result: CommandResult<Outcome>) {
        // A dropped receiver means the caller stopped waiting; nothing to report.
        match (self, result) {
            (responder, Err(err)) => responder.fail(err),
            (Self::Unit(tx), Ok(_)) => {
                let _ = tx.send(Ok(()));
            }
            (Self::Channel(tx), Ok(Outcome::Channel(channel))) => {
                let _ = tx.send(Ok(channel));
            }
            (Self::Channels(tx), Ok(Outcome::Channels(channels))) => {
                let _ = tx.send(Ok(channels));
            }
            (Self::Message(tx), Ok(Outcome::Message(message))) => {
                let _ = tx.send(Ok(message));
            }
            (responder, Ok(other)) => responder.fail(SyncError::Generic {
                code: 0,
                message: format!("unexpected {} result", other.name()),
            }),
        }
    }

    pub(crate) fn fail(self, err: SyncError) {
        match self {
            Self::Unit(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Channel(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Channels(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Message(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct PendingCommand<C> {
    name: &'static str,
    responder: Responder,
    context: C,
}

/// Outstanding commands keyed by id. Taking a command out is the only way to
/// reach its responder, so every result fires at most once.
pub(crate) struct CommandCoordinator<C> {
    next_id: CommandId,
    pending: BTreeMap<CommandId, PendingCommand<C>>,
}

impl<C> CommandCoordinator<C> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn register(
        &mut self,
        name: &'static str,
        responder: Responder,
        context: C,
    ) -> CommandId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingCommand {
                name,
                responder,
                context,
            },
        );
        id
    }

    pub(crate) fn name(&self, id: CommandId) -> Option<&'static str> {
        self.pending.get(&id).map(|pending| pending.name)
    }

    pub(crate) fn take(&mut self, id: CommandId) -> Option<(Responder, C)> {
        self.pending
            .remove(&id)
            .map(|pending| (pending.responder, pending.context))
    }

    pub(crate) fn complete(&mut self, id: CommandId, result: CommandResult<Outcome>) -> bool {
        match self.take(id) {
            Some((responder, _)) => {
                responder.resolve(result);
                true
            }
            None => false,
        }
    }

    /// Force-completes every outstanding command, oldest first.
    pub(crate) fn fail_all(&mut self, err: &SyncError) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (_, command) in pending {
            command.responder.fail(err.clone());
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
