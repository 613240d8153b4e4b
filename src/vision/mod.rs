//! Frame acquisition, remote inference and frame annotation.

pub mod annotate;
pub mod capture;
pub mod classes;
pub mod detector;

pub use annotate::{annotate, count, encode_jpeg, DetectionCounts};
pub use capture::{
    run_capture, CaptureError, CaptureSettings, FfmpegSource, Frame, FrameQueue, FrameSource,
};
pub use classes::{ClassMap, DetectionClass};
pub use detector::{BoundingBox, Detection, Detector, DetectorError, HttpDetector};
