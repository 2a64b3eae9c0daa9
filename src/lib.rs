//! # otp-server
//!
//! A TLS server that authenticates users with one-time passwords over a small
//! XML protocol.
//!
//! A client opens a TLS connection and exchanges [`packet::OtpPacket`]s with the
//! server, one request and one response at a time. `HELLO` starts an
//! authentication flow and yields a process identifier; `ADD` registers a user's
//! public key and OTP seed; `VERIFY` checks a code; `RESYNC` realigns a drifting
//! token from two consecutive codes.
//!
//! ## Layout
//!
//! - [`packet`]: wire model, XML codec and stream framing.
//! - [`session`]: per-connection state machine.
//! - [`authority`]: the shared broker that runs requests, one at a time per
//!   process identifier, against an [`authority::IdentityStore`] and an
//!   [`authority::OtpPolicy`].
//! - [`notify`]: one-shot hand-off of answers from the broker to sessions.
//! - [`server`] and [`tls`]: accept loop and certificate loading.
//! - [`cli`]: command line, logging setup and the server action.

pub mod authority;
pub mod cli;
pub mod notify;
pub mod packet;
pub mod server;
pub mod session;
pub mod tls;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
