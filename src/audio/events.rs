// Telemetry mailbox
// The transport posts events here from the control side; hosts either poll
// the mailbox or register a listener when the player is built. Nothing is
// ever posted from the audio thread.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;

use super::player::PlayerState;
use crate::error::EngineError;

/// Events kept for a host that never polls
const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(PlayerState),
    /// The last frame of the track was played
    Completed,
    Error(EngineError),
}

pub type EventListener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
    listener: Option<EventListener>,
}

impl EventSender {
    pub fn send(&self, event: EngineEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!("Event mailbox full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub struct EventMailbox {
    rx: Receiver<EngineEvent>,
}

impl EventMailbox {
    /// Everything posted since the last call, oldest first
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.rx.try_iter().collect()
    }
}

pub fn mailbox(listener: Option<EventListener>) -> (EventSender, EventMailbox) {
    let (tx, rx) = bounded(MAILBOX_CAPACITY);
    (EventSender { tx, listener }, EventMailbox { rx })
}
