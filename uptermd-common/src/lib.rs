pub mod config;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod types;
pub mod version;

pub use config::Config;
pub use error::UptermdError;
pub use identifier::{Identifier, IdentifierCodec, IdentifierKind};
pub use types::{AuthRequest, Secret, SessionId};
