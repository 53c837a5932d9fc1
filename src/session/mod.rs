pub mod groups;
pub mod registry;

pub use groups::GroupPresenceIndex;
pub use registry::{Connection, SessionRegistry};
