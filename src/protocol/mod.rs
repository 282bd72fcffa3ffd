//! Command protocol shared by the coordinator and every worker
//!
//! Both sides link against the same [`Command`] enumeration and the same
//! [`CommandCodec`] framing rules, so a frame means the same thing on either
//! end of the control channel.
//!
//! # Frame layout
//!
//! ```text
//! ┌──────────────────┬──────┬──────────────────────────┬──────────────┐
//! │ name (ASCII)     │ 0x00 │ stage index (PROCESS)    │ zero padding │
//! │ e.g. "PROCESS"   │      │ i32, little-endian       │              │
//! └──────────────────┴──────┴──────────────────────────┴──────────────┘
//! |<──────────────────────── capacity bytes ──────────────────────────>|
//! ```
//!
//! PROCESS and its stage index travel in the same frame, so one broadcast
//! delivers the complete command.

mod command;

pub use command::{Command, CommandCodec, DEFAULT_FRAME_CAPACITY, MIN_FRAME_CAPACITY};
