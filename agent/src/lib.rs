pub mod annotation;
pub mod context;
pub mod error;
pub mod event;
pub mod reconciler;
pub mod source;
pub mod strategy;

pub use error::{Error, Result};
