//! Half-close state of a virtual connection

use std::sync::atomic::{AtomicU8, Ordering};

const LOCAL_CLOSED: u8 = 0b01;
const REMOTE_CLOSED: u8 = 0b10;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open
    Open,
    /// We will send no more data
    HalfClosedLocal,
    /// The remote will send no more data
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    fn from_bits(bits: u8) -> Self {
        match bits & (LOCAL_CLOSED | REMOTE_CLOSED) {
            0 => StreamState::Open,
            LOCAL_CLOSED => StreamState::HalfClosedLocal,
            REMOTE_CLOSED => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        }
    }
}

/// Lock-free state cell shared by a connection's tasks
#[derive(Debug, Default)]
pub(crate) struct AtomicStreamState(AtomicU8);

impl AtomicStreamState {
    pub(crate) fn get(&self) -> StreamState {
        StreamState::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Close local side. Returns the new state.
    pub(crate) fn close_local(&self) -> StreamState {
        StreamState::from_bits(self.0.fetch_or(LOCAL_CLOSED, Ordering::AcqRel) | LOCAL_CLOSED)
    }

    /// Close remote side. Returns the new state.
    pub(crate) fn close_remote(&self) -> StreamState {
        StreamState::from_bits(self.0.fetch_or(REMOTE_CLOSED, Ordering::AcqRel) | REMOTE_CLOSED)
    }

    pub(crate) fn close(&self) {
        self.0.fetch_or(LOCAL_CLOSED | REMOTE_CLOSED, Ordering::AcqRel);
    }
}
