//! # hive-frame
//!
//! WebSocket frame model for the hive server, per RFC 6455.
//!
//! This crate provides the frame-level vocabulary the server core consumes:
//!
//! - [`Opcode`] — frame opcodes with control/data classification
//! - [`CloseCode`] — close status codes the server emits or validates
//! - [`Frame`] — a single frame with factories for close, ping, pong and
//!   data frames, plus [`Frame::serialize`] / [`Frame::parse`]
//! - [`fragment`] — split a data payload into a continuation chain
//!
//! The server core builds control frames once (a close frame during
//! shutdown, a ping frame for heartbeat sweeps) and shares the serialized
//! bytes across every session, so serialization lives here rather than in
//! the per-connection transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod close;
pub mod frame;
pub mod opcode;

pub use close::CloseCode;
pub use frame::{fragment, Frame, FrameError, EMPTY_PING_FRAME, MAX_CONTROL_PAYLOAD};
pub use opcode::Opcode;
