//! installctl library - client, watcher and rendering for installd front-ends

pub mod cli;
pub mod client;
pub mod commands;
pub mod render;
pub mod watch;
