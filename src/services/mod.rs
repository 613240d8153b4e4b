pub mod detection_store;
pub mod retention;

pub use detection_store::DetectionStore;
