//! # rill-server
//!
//! An RTMFP rendezvous and relay server.
//!
//! The engine turns incoming UDP datagrams into message delivery and
//! drives outgoing reliable transmission:
//!
//! * packet crypto frame — checksum, session-id obfuscation, AES-CBC
//! * handshake state machine — Hello → cookie → key exchange → session
//! * session engine — keepalive, address tracking, ≤1320-byte batching
//! * flow layer — cumulative+selective ACK, retransmission back-off,
//!   fragment reassembly, end/abandon semantics
//! * AMF RPC dispatch and stream play/publish semantics
//! * publication router — one publisher fanned out to many subscribers
//!
//! Sibling adapters carry the work in and out: UDP listeners, a framed
//! TCP bridge for backend RPC, and a read-only HTTP status endpoint.

#![deny(unsafe_code)]

pub mod config;
pub mod counts;
pub mod engine;
pub mod fabric;
pub mod frame;
pub mod session;

pub mod cookies;
pub mod handshake;

pub mod http;
pub mod rpc;
pub mod tcp;
pub mod udp;

pub(crate) mod util;

pub use config::Config;
pub use engine::Engine;
