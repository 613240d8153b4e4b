/// Outbound alert delivery
pub mod alerts;

pub use alerts::{AlertDispatcher, AlertKind, AlertPayload, AlertWebhookClient, SignatureGenerator};
