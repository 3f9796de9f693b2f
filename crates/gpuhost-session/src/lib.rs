//! Sessions and the registry that owns them

pub mod error;
pub mod registry;
pub mod session;

pub use error::SessionError;
pub use registry::{SessionRegistry, SessionTeardown};
pub use session::{Forwarding, ForwardingInfo, Session, SessionView};
