pub mod error;
pub mod types;

pub use error::{RegistryError, Result, TransportFault};
pub use types::{GroupId, MemberConfiguration, PeerAddress};
