use std::fmt;
use std::num::{ParseFloatError, ParseIntError};
use std::str::FromStr;

use imageproc::rect::Rect;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn mid(self, other: Self) -> Self {
        Self {
            x: 0.5 * (self.x + other.x),
            y: 0.5 * (self.y + other.y),
        }
    }
}

/// Box given by two corners, `(x1, y1)` where the drag started and `(x2, y2)`
/// where it ended.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn top_left(&self) -> Point {
        Point { x: self.x1, y: self.y1 }
    }

    pub fn bottom_right(&self) -> Point {
        Point { x: self.x2, y: self.y2 }
    }

    pub fn center(&self) -> Point {
        self.top_left().mid(self.bottom_right())
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Maps a box drawn on an image shown at `ratio` times its original size
    /// back into the pixel space of the original image.
    pub fn unscale(self, ratio: f64) -> Self {
        Self {
            x1: self.x1 / ratio,
            y1: self.y1 / ratio,
            x2: self.x2 / ratio,
            y2: self.y2 / ratio,
        }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f64; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [f64; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

fn unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Box relative to the image size, as used by YOLO label files.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct YoloBox {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
}

impl YoloBox {
    /// Normalises a pixel box against the image dimensions. Every component
    /// is clamped to `0..=1`, so boxes hanging over the image edge stay valid.
    pub fn from_pixels(bbox: BBox, width: u32, height: u32) -> Self {
        let width = width as f64;
        let height = height as f64;
        let center = bbox.center();

        Self {
            cx: unit(center.x / width),
            cy: unit(center.y / height),
            w: unit(bbox.width() / width),
            h: unit(bbox.height() / height),
        }
    }

    pub fn to_pixels(&self, width: u32, height: u32) -> BBox {
        let width = width as f64;
        let height = height as f64;
        BBox {
            x1: (self.cx - self.w / 2.0) * width,
            y1: (self.cy - self.h / 2.0) * height,
            x2: (self.cx + self.w / 2.0) * width,
            y2: (self.cy + self.h / 2.0) * height,
        }
    }

    /// Integer rectangle clipped to the image, never empty.
    pub fn to_rect(&self, width: u32, height: u32) -> Rect {
        let bbox = self.to_pixels(width, height);
        let max_x = width.saturating_sub(1) as f64;
        let max_y = height.saturating_sub(1) as f64;

        let left = bbox.x1.round().clamp(0.0, max_x);
        let top = bbox.y1.round().clamp(0.0, max_y);
        let right = bbox.x2.round().clamp(left, max_x);
        let bottom = bbox.y2.round().clamp(top, max_y);

        Rect::at(left as i32, top as i32).of_size(
            ((right - left) as u32).max(1),
            ((bottom - top) as u32).max(1),
        )
    }
}

/// One line of a YOLO label file.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct YoloLabel {
    pub class_id: usize,
    pub bbox: YoloBox,
}

impl fmt::Display for YoloLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let YoloBox { cx, cy, w, h } = self.bbox;
        write!(f, "{} {cx:.6} {cy:.6} {w:.6} {h:.6}", self.class_id)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseLabelError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid class id: {0}")]
    ClassId(#[source] ParseIntError),
    #[error("invalid coordinate: {0}")]
    Coordinate(#[source] ParseFloatError),
}

impl FromStr for YoloLabel {
    type Err = ParseLabelError;

    // Trailing fields (confidence, track id) are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let mut next = |name| fields.next().ok_or(ParseLabelError::MissingField(name));

        let class_id = next("class_id")?.parse().map_err(ParseLabelError::ClassId)?;
        let mut coord = |name| -> Result<f64, ParseLabelError> {
            next(name)?.parse().map_err(ParseLabelError::Coordinate)
        };
        let cx = coord("center_x")?;
        let cy = coord("center_y")?;
        let w = coord("width")?;
        let h = coord("height")?;

        Ok(Self { class_id, bbox: YoloBox { cx, cy, w, h } })
    }
}

pub fn parse_labels(s: &str) -> Result<Vec<YoloLabel>, ParseLabelError> {
    s.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}
