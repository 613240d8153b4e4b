use image::Rgb;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::warn;

/// Classes emitted by the fire detection model
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionClass {
    Fire,
    Light,
    NoFire,
    Smoke,
}

impl DetectionClass {
    /// Only fire and smoke count towards the live status; the others are
    /// distractor classes.
    pub fn is_counted(&self) -> bool {
        matches!(self, DetectionClass::Fire | DetectionClass::Smoke)
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            DetectionClass::Fire => Rgb([255, 0, 0]),
            DetectionClass::Light => Rgb([255, 255, 0]),
            DetectionClass::NoFire => Rgb([0, 255, 0]),
            DetectionClass::Smoke => Rgb([128, 128, 128]),
        }
    }
}

/// Maps model class ids to [`DetectionClass`] using the configured class names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    classes: Vec<Option<DetectionClass>>,
}

impl ClassMap {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        let classes = names
            .iter()
            .map(|name| {
                let name = name.as_ref().trim();
                let parsed = DetectionClass::from_str(name).ok();
                if parsed.is_none() {
                    warn!(class = name, "Unknown model class name; detections will be ignored");
                }
                parsed
            })
            .collect();
        Self { classes }
    }

    pub fn resolve(&self, class_id: usize) -> Option<DetectionClass> {
        self.classes.get(class_id).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for ClassMap {
    fn default() -> Self {
        Self::new(&["fire", "light", "no-fire", "smoke"])
    }
}
