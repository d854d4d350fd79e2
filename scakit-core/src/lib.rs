//! Connection security and authorization protocol engine for Strong
//! Customer Authentication.
//!
//! The engine enrolls device-to-provider connections, signs every API
//! request with a connection-held private key, decrypts pending
//! authorization challenges (two coexisting protocol generations), tracks
//! each challenge to a terminal disposition, and gates the whole
//! capability behind a local passcode lockout policy.

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod client;
pub use client::*;

mod clock;
pub use clock::*;

pub mod codec;

mod connection;
pub use connection::*;

mod error;
pub use error::*;

mod keys;
pub use keys::*;

mod lifecycle;
pub use lifecycle::*;

mod lockout;
pub use lockout::*;

mod queue;
pub use queue::*;

mod request;
pub use request::Request;

mod signer;
pub use signer::*;
