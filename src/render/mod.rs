//! Render backends: the one capability every display path implements.

pub mod accelerated;
pub mod external;
pub mod gpu;

use std::sync::Arc;

use crate::buffer::{Lookup, RollingBuffer};
use crate::decode::DecodedFrame;
use crate::error::BackendError;
use crate::events::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// `None` for a zero delta.
    #[must_use]
    pub const fn of(delta: i64) -> Option<Self> {
        if delta > 0 {
            Some(Self::Forward)
        } else if delta < 0 {
            Some(Self::Backward)
        } else {
            None
        }
    }
}

/// What a backend is asked to show for one sequence position.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Decoded pixels lent by the rolling buffer for the duration of the call.
    Pixels {
        index: usize,
        tier: Tier,
        image: Arc<DecodedFrame>,
    },
    /// Nothing decoded yet, or the slot failed.
    Placeholder { index: usize, failed: bool },
    /// A position in the backend's own file list.
    Listed { index: usize },
}

impl Frame {
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Pixels { index, .. } | Self::Placeholder { index, .. } | Self::Listed { index } => {
                *index
            }
        }
    }

    /// Best available content for `index` in `buffer`.
    #[must_use]
    pub fn from_buffer(buffer: &RollingBuffer, index: usize) -> Self {
        match buffer.get(index) {
            Lookup::Ready { tier, frame } => Self::Pixels {
                index,
                tier,
                image: frame,
            },
            Lookup::Failed(_) => Self::Placeholder {
                index,
                failed: true,
            },
            Lookup::Pending | Lookup::Absent => Self::Placeholder {
                index,
                failed: false,
            },
        }
    }
}

/// A display path driven by session signals.
pub trait RenderBackend: Send {
    fn display(&mut self, frame: Frame) -> Result<(), BackendError>;

    /// Step one position.
    fn advance(&mut self, direction: Direction) -> Result<(), BackendError>;

    /// Release the display resources. Called once.
    fn close(&mut self) -> Result<(), BackendError>;
}
