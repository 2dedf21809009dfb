//! Outbound command backlog.
//!
//! Every producer appends; the transport task is the only consumer and takes
//! one frame per dispatch tick. Frames are never reordered or merged.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use ulab_protocol::{Command, Frame};

/// Cloneable handle to the shared FIFO of not-yet-sent frames.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    frames: Arc<Mutex<VecDeque<Frame>>>,
}

impl CommandQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one pre-encoded frame.
    pub fn push(&self, frame: Frame) {
        self.frames.lock().push_back(frame);
    }

    /// Encode `command` and append it as many times as the device requires.
    pub fn push_command(&self, command: Command) {
        let frame = command.to_frame();
        let mut frames = self.frames.lock();
        for _ in 0..command.repeat() {
            frames.push_back(frame);
        }
        tracing::trace!(?command, backlog = frames.len(), "queued command");
    }

    /// Take the oldest frame.
    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    /// Drop every frame not yet written. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let discarded = frames.len();
        frames.clear();
        discarded
    }

    /// Keep only the frames `keep` accepts, in order. Returns how many were
    /// discarded.
    pub fn retain(&self, mut keep: impl FnMut(&Frame) -> bool) -> usize {
        let mut frames = self.frames.lock();
        let before = frames.len();
        frames.retain(|frame| keep(frame));
        before - frames.len()
    }

    /// Frames waiting.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Nothing waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Copy of the backlog in send order.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.lock().iter().copied().collect()
    }
}
