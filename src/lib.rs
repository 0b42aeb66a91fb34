pub mod common;
pub mod operation;
pub mod registry;
pub mod timer;
pub mod watch_list;
