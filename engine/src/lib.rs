//! ChannelMix: live multi-channel RTP multicast audio, fanned out to
//! WebSocket sessions and mixed per client.
//!
//! Engine side: [`ingest`] -> [`distributor`] -> [`server`] sessions, plus the
//! [`admin`] relay to the upstream stream generator.
//!
//! Client side: [`client`] session -> [`controller`] -> [`playout`] rings and
//! render thread.

pub mod admin;
pub mod client;
pub mod config;
pub mod controller;
pub mod distributor;
pub mod error;
pub mod ingest;
pub mod pcm;
pub mod playout;
pub mod protocol;
pub mod ring_buffer;
pub mod server;
