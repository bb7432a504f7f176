//! Core trait definitions

mod channel;
mod session;

pub use channel::{Channel, CloseHandler, MessageHandler};
pub use session::{Session, SessionEvent, SessionEvents};
