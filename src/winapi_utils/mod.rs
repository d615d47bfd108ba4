//! Windows implementation of the native event source.
//!
//! A dedicated thread owns a hidden window registered for session
//! notifications and pumps its messages until asked to quit.

pub mod message_loop;
pub mod session;
pub mod window;

pub use message_loop::*;
pub use session::*;
pub use window::*;
