use math::BBox;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

fn default_ratio() -> f64 {
    1.0
}

/// One labelled box on one image.
///
/// `coords` are `[x1, y1, x2, y2]` in the space the box was drawn in, i.e. on
/// the image as displayed. `ratio` is the displayed size divided by the
/// original size at that moment, so `coords / ratio` gives original pixels.
///
/// Unknown fields written by older clients are ignored on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub coords: [f64; 4],
    pub text: String,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

impl Annotation {
    pub fn new(coords: [f64; 4], text: impl Into<String>, ratio: f64) -> Result<Self> {
        let annotation = Self { coords, text: text.into(), ratio };
        annotation.validate()?;
        Ok(annotation)
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidAnnotation("label is empty".into()));
        }
        if !self.ratio.is_finite() || self.ratio <= 0.0 {
            return Err(Error::InvalidAnnotation(format!("ratio {} is not positive", self.ratio)));
        }
        if self.coords.iter().any(|c| !c.is_finite()) {
            return Err(Error::InvalidAnnotation(format!("coords {:?} are not finite", self.coords)));
        }
        Ok(())
    }

    pub fn bbox(&self) -> BBox {
        BBox::from(self.coords)
    }

    /// Box in the pixel space of the original image.
    pub fn original_bbox(&self) -> BBox {
        self.bbox().unscale(self.ratio)
    }

    pub fn original_coords(&self) -> [f64; 4] {
        self.original_bbox().to_array()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "coords": self.coords,
            "text": self.text,
            "ratio": self.ratio,
        })
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
