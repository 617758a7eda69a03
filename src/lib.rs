#![forbid(unsafe_code)]

// Voice service library - control plane for multi-party voice/video channels

pub mod auth;
pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod store;

#[cfg(test)]
mod testing;
