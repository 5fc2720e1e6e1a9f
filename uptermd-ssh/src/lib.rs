pub mod frontend;
pub mod keys;
mod piper;
pub mod sshd;

pub use frontend::SshFrontend;
pub use piper::PiperHandler;
pub use sshd::{SshdHandler, SshdServer};
