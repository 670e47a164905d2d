pub mod circuit;
pub mod config;
pub mod core;
pub mod dedup;
pub mod error;
pub mod hooks;
pub mod log;
pub mod pass;
pub mod process;
pub mod replenish;
pub mod selector;
pub mod store;
pub mod unblock;
pub mod util;

pub use error::{Error, Result};
pub use pass::{run_pass, PassContext, PassOptions, PassSummary};
