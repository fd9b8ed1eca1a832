//! Frame-space to display-space coordinate mapping for overlay renderers.
//!
//! Detector output lives in sensor pixels; overlays are drawn in view pixels,
//! mirrored horizontally when the preview comes from a front-facing lens.

use crate::types::Rect;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("coordinate mapper used before configure()")]
    NotConfigured,
    #[error("invalid mapper dimensions: frame {frame_width}x{frame_height}, view {view_width}x{view_height}")]
    InvalidDimensions {
        frame_width: f32,
        frame_height: f32,
        view_width: f32,
        view_height: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    scale_x: f32,
    scale_y: f32,
    view_width: f32,
    is_front_facing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinateMapper {
    transform: Option<Transform>,
}

impl CoordinateMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor: a mapper that is already configured.
    pub fn configured(
        frame_width: f32,
        frame_height: f32,
        view_width: f32,
        view_height: f32,
        is_front_facing: bool,
    ) -> Result<Self, ConfigurationError> {
        let mut mapper = Self::new();
        mapper.configure(frame_width, frame_height, view_width, view_height, is_front_facing)?;
        Ok(mapper)
    }

    /// Set the source and target geometry. Must be called before mapping.
    pub fn configure(
        &mut self,
        frame_width: f32,
        frame_height: f32,
        view_width: f32,
        view_height: f32,
        is_front_facing: bool,
    ) -> Result<(), ConfigurationError> {
        let valid = [frame_width, frame_height, view_width, view_height]
            .iter()
            .all(|d| d.is_finite() && *d > 0.0);
        if !valid {
            return Err(ConfigurationError::InvalidDimensions {
                frame_width,
                frame_height,
                view_width,
                view_height,
            });
        }

        self.transform = Some(Transform {
            scale_x: view_width / frame_width,
            scale_y: view_height / frame_height,
            view_width,
            is_front_facing,
        });
        tracing::debug!(
            frame_width,
            frame_height,
            view_width,
            view_height,
            is_front_facing,
            "coordinate mapper configured"
        );
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.transform.is_some()
    }

    /// Map one frame-space rectangle into view space.
    pub fn map(&self, rect: &Rect) -> Result<Rect, ConfigurationError> {
        let t = self.transform.ok_or(ConfigurationError::NotConfigured)?;

        let mut left = rect.left * t.scale_x;
        let mut right = rect.right * t.scale_x;
        let top = rect.top * t.scale_y;
        let bottom = rect.bottom * t.scale_y;

        if t.is_front_facing {
            let center_x = t.view_width / 2.0;
            let mirrored_left = 2.0 * center_x - left;
            let mirrored_right = 2.0 * center_x - right;
            // Mirroring flips orientation; swap so left <= right still holds.
            left = mirrored_right;
            right = mirrored_left;
        }

        Ok(Rect {
            left: left.min(right),
            top,
            right: left.max(right),
            bottom,
        })
    }

    /// Map a single point (e.g. a landmark) into view space.
    pub fn map_point(&self, point: (f32, f32)) -> Result<(f32, f32), ConfigurationError> {
        let t = self.transform.ok_or(ConfigurationError::NotConfigured)?;
        let x = point.0 * t.scale_x;
        let y = point.1 * t.scale_y;
        let x = if t.is_front_facing { t.view_width - x } else { x };
        Ok((x, y))
    }

    /// Like [`map`](Self::map), but an unconfigured mapper logs and hands the
    /// input back unchanged instead of failing.
    pub fn map_or_passthrough(&self, rect: &Rect) -> Rect {
        match self.map(rect) {
            Ok(mapped) => mapped,
            Err(err) => {
                tracing::warn!(error = %err, "returning rectangle unmapped");
                *rect
            }
        }
    }

    /// Map a batch of rectangles, preserving order. Inputs are not modified.
    pub fn map_all(&self, rects: &[Rect]) -> Result<Vec<Rect>, ConfigurationError> {
        rects.iter().map(|r| self.map(r)).collect()
    }
}
