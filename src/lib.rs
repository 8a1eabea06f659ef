pub mod constants;
pub mod detector;
pub mod finalizer;
pub mod ingress;
pub mod line_buffer;
pub mod logging;
pub mod main_helper;
pub mod reconciler;
pub mod session;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
