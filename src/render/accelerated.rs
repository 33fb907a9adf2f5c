//! In-process backend that uploads buffered frames into a GPU texture.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::RollingBuffer;
use crate::error::BackendError;
use crate::events::Tier;
use crate::render::{Direction, Frame, RenderBackend};

const BLANK: [f64; 4] = [0.0, 0.0, 0.0, 1.0];
const FAILED: [f64; 4] = [0.25, 0.0, 0.0, 1.0];

/// The GPU-facing half of the accelerated backend.
pub trait TextureTarget: Send {
    /// Replace the displayed image with tightly packed RGBA8 data.
    fn upload(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<(), BackendError>;
    /// Replace the displayed image with a solid color.
    fn clear(&mut self, color: [f64; 4]) -> Result<(), BackendError>;
    /// Submit a redraw of whatever was last uploaded or cleared.
    fn present(&mut self) -> Result<(), BackendError>;
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    Image(usize, Tier),
    Placeholder(usize, bool),
}

pub struct AcceleratedBackend<T: TextureTarget> {
    target: Option<T>,
    buffer: Arc<RollingBuffer>,
    position: usize,
    shown: Option<Shown>,
}

impl<T: TextureTarget> AcceleratedBackend<T> {
    pub const fn new(target: T, buffer: Arc<RollingBuffer>) -> Self {
        Self {
            target: Some(target),
            buffer,
            position: 0,
            shown: None,
        }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }
}

impl<T: TextureTarget> RenderBackend for AcceleratedBackend<T> {
    fn display(&mut self, frame: Frame) -> Result<(), BackendError> {
        let frame = match frame {
            Frame::Listed { index } => Frame::from_buffer(&self.buffer, index),
            other => other,
        };
        self.position = frame.index();
        let target = self
            .target
            .as_mut()
            .ok_or_else(|| BackendError::Fatal("render target already released".into()))?;

        let (shown, image) = match frame {
            Frame::Pixels { index, tier, image } => (Shown::Image(index, tier), Some(image)),
            Frame::Placeholder { index, failed } => (Shown::Placeholder(index, failed), None),
            Frame::Listed { index } => (Shown::Placeholder(index, false), None),
        };
        if self.shown == Some(shown) {
            return Ok(());
        }

        match (image, shown) {
            (Some(image), _) => {
                let expected = u64::from(image.width) * u64::from(image.height) * 4;
                if image.byte_len() != expected {
                    return Err(BackendError::Frame(format!(
                        "frame {} has {} bytes, expected {expected}",
                        image.index,
                        image.byte_len()
                    )));
                }
                target.upload(image.width, image.height, &image.pixels)?;
            }
            (None, Shown::Placeholder(_, true)) => target.clear(FAILED)?,
            (None, _) => target.clear(BLANK)?,
        }
        target.present()?;
        debug!(?shown, "frame presented");
        self.shown = Some(shown);
        Ok(())
    }

    fn advance(&mut self, direction: Direction) -> Result<(), BackendError> {
        let last = self.buffer.len().saturating_sub(1);
        let next = match direction {
            Direction::Forward => (self.position + 1).min(last),
            Direction::Backward => self.position.saturating_sub(1),
        };
        self.display(Frame::Listed { index: next })
    }

    fn close(&mut self) -> Result<(), BackendError> {
        if let Some(mut target) = self.target.take() {
            target.release();
            debug!("render target released");
        }
        Ok(())
    }
}
