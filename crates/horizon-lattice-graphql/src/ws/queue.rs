//! Frames waiting for the connection to open.

use std::collections::VecDeque;

use super::message::MessageType;

/// An encoded frame held until the socket is available.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct QueuedFrame {
    pub(crate) kind: MessageType,
    pub(crate) id: Option<String>,
    pub(crate) text: String,
}

/// FIFO of frames written in enqueue order once the connection opens.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, frame: QueuedFrame) {
        self.frames.push_back(frame);
    }

    /// Put frames that could not be written back at the head, keeping their order.
    pub(crate) fn requeue_front(&mut self, frames: impl DoubleEndedIterator<Item = QueuedFrame>) {
        for frame in frames.rev() {
            self.frames.push_front(frame);
        }
    }

    /// Take every frame, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<QueuedFrame> {
        self.frames.drain(..).collect()
    }

    /// Remove a still-pending `start` for `id`. Returns whether one was found.
    pub(crate) fn remove_start(&mut self, id: &str) -> bool {
        let before = self.frames.len();
        self.frames
            .retain(|frame| !(frame.kind == MessageType::Start && frame.id.as_deref() == Some(id)));
        self.frames.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}
