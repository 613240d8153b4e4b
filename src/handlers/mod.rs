use crate::errors::ServiceError;
use axum::Json;

pub mod monitor;
pub mod pages;
pub mod reports;

/// JSON result type shared by the handlers
pub type HandlerResult<T> = Result<Json<T>, ServiceError>;
