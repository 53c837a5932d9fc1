pub mod actor;
pub mod frame;
pub mod handler;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod replay;
