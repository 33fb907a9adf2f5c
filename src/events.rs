use std::fmt;

use crate::store::RootId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u32);

/// Identifies one publisher on the bus. Sequence numbers are monotonic per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolution level of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Thumbnail,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The controller stopped the session.
    Stopped,
    /// A backend reported an unrecoverable error.
    BackendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    SessionStarted { session_id: SessionId },
    SessionEnded { session_id: SessionId, reason: EndReason },
    /// `position` is the current index after applying `delta`.
    Navigate { delta: i64, position: usize },
    FolderToggled { root_id: RootId, active: bool },
    BackendReady { backend_id: BackendId },
    BackendError { backend_id: BackendId, detail: String },
    /// A slot gained a decoded tier.
    FrameReady { index: usize, tier: Tier },
    /// A slot failed to decode. Reported once per cold entry into the window.
    DecodeFailed { index: usize, detail: String },
}

/// Payload-free discriminant of [`SignalKind`], used for policies and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalTag {
    SessionStarted,
    SessionEnded,
    Navigate,
    FolderToggled,
    BackendReady,
    BackendError,
    FrameReady,
    DecodeFailed,
}

impl SignalKind {
    #[must_use]
    pub const fn tag(&self) -> SignalTag {
        match self {
            Self::SessionStarted { .. } => SignalTag::SessionStarted,
            Self::SessionEnded { .. } => SignalTag::SessionEnded,
            Self::Navigate { .. } => SignalTag::Navigate,
            Self::FolderToggled { .. } => SignalTag::FolderToggled,
            Self::BackendReady { .. } => SignalTag::BackendReady,
            Self::BackendError { .. } => SignalTag::BackendError,
            Self::FrameReady { .. } => SignalTag::FrameReady,
            Self::DecodeFailed { .. } => SignalTag::DecodeFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub sender: SenderId,
    pub seq: u64,
    pub kind: SignalKind,
}
