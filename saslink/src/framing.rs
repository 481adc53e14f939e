//! Byte classification for a bus with no delimiter bytes.
//!
//! The only unambiguous sign that the host has started a new address
//! cycle is a byte that arrives with a parity error (the wake-up bit).
//! That sign is only trusted when no earlier byte is still waiting in
//! the receive queue, since parity noise in the middle of a message must
//! not be mistaken for addressing.
//!
//! A clean [POLL_MARKER] that shows up while a message is still queued
//! means frame alignment has been lost. The framer then resynchronizes:
//! it hands the next traffic poll to the caller as a resumption point,
//! and only returns to [LinkState::Idle] after a genuine wake-up.

use crate::config::POLL_MARKER;
use crate::port::RawByteSample;

/// Framing state of one open port session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LinkState {
    /// Synchronized, receive queue empty.
    #[default]
    Idle,
    /// Synchronized, more bytes of the current message are queued.
    MidMessage,
    /// Alignment lost, receive queue empty.
    Resynchronizing,
    /// Alignment lost, more bytes are queued.
    ResynchronizingMidMessage,
}

impl LinkState {
    pub const fn new(resynchronizing: bool, message_queued: bool) -> Self {
        match (resynchronizing, message_queued) {
            (false, false) => LinkState::Idle,
            (false, true) => LinkState::MidMessage,
            (true, false) => LinkState::Resynchronizing,
            (true, true) => LinkState::ResynchronizingMidMessage,
        }
    }

    pub const fn is_resynchronizing(self) -> bool {
        matches!(
            self,
            LinkState::Resynchronizing | LinkState::ResynchronizingMidMessage
        )
    }

    pub const fn message_queued(self) -> bool {
        matches!(
            self,
            LinkState::MidMessage | LinkState::ResynchronizingMidMessage
        )
    }

    const fn with_resynchronizing(self, resynchronizing: bool) -> Self {
        Self::new(resynchronizing, self.message_queued())
    }

    const fn with_message_queued(self, message_queued: bool) -> Self {
        Self::new(self.is_resynchronizing(), message_queued)
    }
}

/// What the framer decided about one successfully read byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Classification {
    /// An ordinary data byte.
    Data,
    /// The start of a new address cycle.
    WakeUp,
    /// A clean poll marker with a message still queued. Alignment is lost.
    AmbiguousPoll,
    /// A traffic poll seen while resynchronizing, framing resumes here.
    Resume,
}

impl Classification {
    pub const fn is_wake_up(self) -> bool {
        matches!(self, Classification::WakeUp)
    }
}

/// The byte framing state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Framer {
    state: LinkState,
    last: Option<Classification>,
}

impl Framer {
    pub const fn new() -> Self {
        Self {
            state: LinkState::Idle,
            last: None,
        }
    }

    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Classification of the most recent successfully read byte.
    pub const fn last_classification(&self) -> Option<Classification> {
        self.last
    }

    /// Forget everything, for a new port session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Classify a byte from a successful read and update the link state.
    ///
    /// Failed reads carry no byte. They leave the state untouched and
    /// classify as [Classification::Data].
    pub fn classify(&mut self, sample: &RawByteSample, is_long_poll: bool) -> Classification {
        if !sample.read_succeeded {
            return Classification::Data;
        }

        let is_poll_marker = sample.value == POLL_MARKER;
        let is_traffic_poll = is_poll_marker && !is_long_poll;

        let class = if is_traffic_poll && self.state.is_resynchronizing() {
            // state stays put, only a wake-up ends resynchronization
            log::trace!("resuming framing at poll marker");
            Classification::Resume
        } else {
            let class = if sample.had_parity_error && !self.state.message_queued() {
                if self.state.is_resynchronizing() {
                    log::debug!("wake-up 0x{:02x}, resynchronized", sample.value);
                }
                self.state = self.state.with_resynchronizing(false);
                Classification::WakeUp
            } else if is_traffic_poll
                && !sample.had_parity_error
                && self.state.message_queued()
            {
                if !self.state.is_resynchronizing() {
                    log::debug!(
                        "clean poll marker with {} byte(s) queued, resynchronizing",
                        sample.queue_depth_after_read
                    );
                }
                self.state = self.state.with_resynchronizing(true);
                Classification::AmbiguousPoll
            } else {
                Classification::Data
            };

            self.state = self
                .state
                .with_message_queued(sample.queue_depth_after_read > 0);
            class
        };

        self.last = Some(class);
        class
    }
}
