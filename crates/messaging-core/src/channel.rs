use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{PollCommand, PollerEvent};

/// Broadcast event stream type used by subscribers.
pub type EventStream = broadcast::Receiver<PollerEvent>;

/// Errors returned by poll channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollChannelError {
    /// The runtime stopped and no longer reads commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair shared by the runtime and its handles.
///
/// Commands are unbounded so handle methods never block the caller.
#[derive(Clone, Debug)]
pub struct PollChannels {
    command_tx: mpsc::UnboundedSender<PollCommand>,
    event_tx: broadcast::Sender<PollerEvent>,
}

impl PollChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(event_buffer: usize) -> (Self, mpsc::UnboundedReceiver<PollCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<PollerEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted poller events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub fn send_command(&self, command: PollCommand) -> Result<(), PollChannelError> {
        self.command_tx
            .send(command)
            .map_err(|_| PollChannelError::CommandChannelClosed)
    }

    /// Whether the runtime has stopped reading commands.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}
