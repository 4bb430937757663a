//! Starting handler processes and keeping track of them until they exit

pub mod fork_child;
mod reaper;
mod spawn;

pub use reaper::*;
pub use spawn::*;
