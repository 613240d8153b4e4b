pub mod detection;
pub mod detection_log;
pub mod detection_session;

pub use detection::Entity as Detection;
pub use detection_log::Entity as DetectionLog;
pub use detection_session::Entity as DetectionSession;
