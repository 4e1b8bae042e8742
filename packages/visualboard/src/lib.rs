//! Rofan Visualboard: keeps a visual story board in sync with the latest
//! turn of a chat page across four extension contexts (page hook, content
//! bridge, background router, side panel).

pub mod background;
pub mod cli;
pub mod commands;
pub mod config;
pub mod content;
pub mod dom;
pub mod error;
pub mod model;
pub mod page_hook;
pub mod protocol;
pub mod runtime;
pub mod sidepanel;
pub mod storage;

pub use error::{Result, VisualboardError};
