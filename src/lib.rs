//! passage: a zero-knowledge ephemeral signaling relay.
//!
//! Two devices that share an out-of-band invite code use this server to
//! exchange opaque ciphertext, either as a chunked store-and-forward
//! mailbox or as WebRTC offer/answer envelopes for a later peer-to-peer
//! connection. The server stores ciphertext and TTL'd metadata only; it
//! holds no keys and reads no plaintext, and every record destroys itself.

pub mod api;
pub mod config;
pub mod discovery;
pub mod edition;
pub mod handshake;
pub mod keys;
pub mod logging;
pub mod relay;
pub mod service;
pub mod store;
pub mod sweep;
