//! Canonical box geometry
//!
//! Every backend reports text boxes in its own coordinate convention. This
//! module owns the single representation the rest of the service speaks:
//! integer pixel coordinates, y growing downward, four corners named after
//! the text's reading orientation. Adapters convert on the way out and
//! nothing downstream ever sees a backend-native coordinate.

use serde::{Deserialize, Serialize};

/// A point in canonical pixel space (y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vertex {
    pub x: i32,
    pub y: i32,
}

impl Vertex {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A four-corner box in canonical pixel space.
///
/// Corner names follow the text's reading orientation: `top_left` is where
/// reading starts, whatever the source backend called that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quad {
    pub top_left: Vertex,
    pub top_right: Vertex,
    pub bottom_right: Vertex,
    pub bottom_left: Vertex,
}

impl Quad {
    /// Axis-aligned quad covering the rectangle at `(x, y)` with size `w × h`.
    pub fn from_rect(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            top_left: Vertex::new(x, y),
            top_right: Vertex::new(x + w, y),
            bottom_right: Vertex::new(x + w, y + h),
            bottom_left: Vertex::new(x, y + h),
        }
    }

    /// Corners in reading order: top-left, top-right, bottom-right,
    /// bottom-left.
    pub fn corners(&self) -> [Vertex; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }

    /// Smallest axis-aligned rectangle containing all four corners, as
    /// `(x, y, width, height)`.
    pub fn bounding_rect(&self) -> (i32, i32, i32, i32) {
        let corners = self.corners();
        let min_x = corners.iter().map(|v| v.x).min().unwrap_or(0);
        let max_x = corners.iter().map(|v| v.x).max().unwrap_or(0);
        let min_y = corners.iter().map(|v| v.y).min().unwrap_or(0);
        let max_y = corners.iter().map(|v| v.y).max().unwrap_or(0);
        (min_x, min_y, max_x - min_x, max_y - min_y)
    }
}

/// Where a backend's raw y axis starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalOrigin {
    /// y grows downward from the top edge (canonical).
    TopDown,
    /// y grows upward from the bottom edge.
    BottomUp,
}

/// The coordinate convention a backend emits boxes in. Declared once per
/// adapter, applied to every box it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSpace {
    /// Coordinates are fractions of the image dimensions in `[0, 1]`.
    pub normalized: bool,
    pub vertical_origin: VerticalOrigin,
}

impl SourceSpace {
    /// Canonical pixel space; canonicalizing through it changes nothing.
    pub const CANONICAL: Self = Self {
        normalized: false,
        vertical_origin: VerticalOrigin::TopDown,
    };

    /// Normalized coordinates with y measured up from the bottom edge, as
    /// emitted by Apple-style vision frameworks.
    pub const NORMALIZED_BOTTOM_UP: Self = Self {
        normalized: true,
        vertical_origin: VerticalOrigin::BottomUp,
    };
}

/// Reading order reported by a backend's layout analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadingDirection {
    #[default]
    Standard,
    /// Right-to-left or vertical-reversed reading order. Corner roles are
    /// remapped so the canonical names still point where reading starts.
    Reversed,
}

/// A box exactly as a backend reported it: corners named in the backend's
/// own labeling, coordinates still in the backend's space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawQuad {
    pub top_left: (f32, f32),
    pub top_right: (f32, f32),
    pub bottom_right: (f32, f32),
    pub bottom_left: (f32, f32),
}

impl RawQuad {
    /// Axis-aligned raw quad from two opposite corners, in whatever space
    /// the adapter is working in.
    pub fn axis_aligned(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            top_left: (x0, y0),
            top_right: (x1, y0),
            bottom_right: (x1, y1),
            bottom_left: (x0, y1),
        }
    }
}

fn to_pixel(pt: (f32, f32), space: SourceSpace, width: u32, height: u32) -> Vertex {
    let (mut x, mut y) = pt;
    if space.normalized {
        x *= width as f32;
        y *= height as f32;
    }
    if space.vertical_origin == VerticalOrigin::BottomUp {
        y = height as f32 - y;
    }
    Vertex::new(x.round() as i32, y.round() as i32)
}

fn from_pixel(v: Vertex, space: SourceSpace, width: u32, height: u32) -> (f32, f32) {
    let mut x = v.x as f32;
    let mut y = v.y as f32;
    if space.vertical_origin == VerticalOrigin::BottomUp {
        y = height as f32 - y;
    }
    if space.normalized {
        x /= width as f32;
        y /= height as f32;
    }
    (x, y)
}

/// Convert a backend-native quad into canonical pixel space.
///
/// Scaling and the vertical flip happen per corner; the reading-direction
/// remap happens last and reassigns whole points to new corner names rather
/// than relabeling coordinates in place.
pub fn canonicalize(
    raw: &RawQuad,
    space: SourceSpace,
    width: u32,
    height: u32,
    direction: ReadingDirection,
) -> Quad {
    let quad = Quad {
        top_left: to_pixel(raw.top_left, space, width, height),
        top_right: to_pixel(raw.top_right, space, width, height),
        bottom_right: to_pixel(raw.bottom_right, space, width, height),
        bottom_left: to_pixel(raw.bottom_left, space, width, height),
    };
    match direction {
        ReadingDirection::Standard => quad,
        ReadingDirection::Reversed => Quad {
            top_left: quad.bottom_left,
            top_right: quad.top_left,
            bottom_right: quad.top_right,
            bottom_left: quad.bottom_right,
        },
    }
}

/// Convert a canonical quad back into `space` coordinates. The inverse of
/// [`canonicalize`] up to pixel rounding; used when a backend only accepts
/// regions in its own convention.
pub fn decanonicalize(quad: &Quad, space: SourceSpace, width: u32, height: u32) -> RawQuad {
    RawQuad {
        top_left: from_pixel(quad.top_left, space, width, height),
        top_right: from_pixel(quad.top_right, space, width, height),
        bottom_right: from_pixel(quad.bottom_right, space, width, height),
        bottom_left: from_pixel(quad.bottom_left, space, width, height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_space_is_identity() {
        let quad = Quad::from_rect(12, 34, 56, 78);
        let raw = decanonicalize(&quad, SourceSpace::CANONICAL, 640, 480);
        let again = canonicalize(&raw, SourceSpace::CANONICAL, 640, 480, ReadingDirection::Standard);
        assert_eq!(quad, again);
    }

    #[test]
    fn normalized_bottom_up_round_trips() {
        let quad = Quad::from_rect(10, 140, 40, 40);
        let raw = decanonicalize(&quad, SourceSpace::NORMALIZED_BOTTOM_UP, 100, 200);
        let again = canonicalize(
            &raw,
            SourceSpace::NORMALIZED_BOTTOM_UP,
            100,
            200,
            ReadingDirection::Standard,
        );
        assert_eq!(quad, again);
    }

    #[test]
    fn flips_normalized_bottom_up_coordinates() {
        // 100x200 image; a box reported in normalized bottom-up coordinates
        // must land in the upper half of the pixel grid.
        let raw = RawQuad {
            bottom_left: (0.1, 0.1),
            bottom_right: (0.5, 0.1),
            top_right: (0.5, 0.3),
            top_left: (0.1, 0.3),
        };
        let quad = canonicalize(
            &raw,
            SourceSpace::NORMALIZED_BOTTOM_UP,
            100,
            200,
            ReadingDirection::Standard,
        );
        assert_eq!(quad.top_left, Vertex::new(10, 140));
        assert_eq!(quad.top_right, Vertex::new(50, 140));
        assert_eq!(quad.bottom_right, Vertex::new(50, 180));
        assert_eq!(quad.bottom_left, Vertex::new(10, 180));
    }

    #[test]
    fn reversed_layout_remaps_points_to_new_corners() {
        let raw = RawQuad {
            top_left: (0.0, 0.0),
            top_right: (10.0, 0.0),
            bottom_right: (10.0, 20.0),
            bottom_left: (0.0, 20.0),
        };
        let quad = canonicalize(
            &raw,
            SourceSpace::CANONICAL,
            100,
            100,
            ReadingDirection::Reversed,
        );
        // The physical points move to different names; none is merely
        // relabeled in place.
        assert_eq!(quad.top_left, Vertex::new(0, 20));
        assert_eq!(quad.top_right, Vertex::new(0, 0));
        assert_eq!(quad.bottom_right, Vertex::new(10, 0));
        assert_eq!(quad.bottom_left, Vertex::new(10, 20));
    }

    #[test]
    fn bounding_rect_covers_rotated_corners() {
        let quad = Quad {
            top_left: Vertex::new(10, 5),
            top_right: Vertex::new(40, 12),
            bottom_right: Vertex::new(36, 44),
            bottom_left: Vertex::new(6, 37),
        };
        assert_eq!(quad.bounding_rect(), (6, 5, 34, 39));
    }
}
