//! Breadcrumb extension host wire protocol
//!
//! Message vocabulary and framing shared by the host supervisor (in the
//! `breadcrumb` crate) and the isolated worker process that runs extension
//! code (`breadcrumb-ext-worker`).
//!
//! # Framing
//!
//! Each message is one frame: `[length: u32 BE][payload: length bytes]`, where
//! the payload is a UTF-8 JSON object tagged by `"type"`. The host writes
//! [`HostMessage`] frames to the worker's stdin; the worker writes
//! [`WorkerMessage`] frames to its stdout. Stderr is free-form log output.

mod codec;
mod message;

pub use codec::{FrameError, FrameReader, FrameWriter, MAX_FRAME_LEN};
pub use message::*;
