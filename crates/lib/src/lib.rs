//! adblocks core library: a HipChat webhook relay that answers a room message with a
//! random image from Bing image search, served over HTTP or FastCGI.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod relay;
pub mod search;
