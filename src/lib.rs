//! Bridge between a Daum ergometer's RS232 protocol and downstream
//! fitness consumers.
//!
//! The heart of the crate is [`daum::ErgoSession`]: it owns the serial
//! channel, discovers the cockpit address, paces a priority command queue
//! against the device's timing, interprets telemetry, and in SIM mode
//! closes the loop between road physics and the cockpit's resistance.
//! External collaborators (a wireless fitness profile, a local UI) interact
//! through [`daum::SessionHandle`] and the broadcast channels it exposes.

pub mod config;
pub mod daum;
