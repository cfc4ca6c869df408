//! Line-framed JSON protocol spoken over a worker's stdin/stdout.
//!
//! Every frame is one JSON object terminated by `\n`, tagged by a `type`
//! field (`request`, `response` or `notification`). The decoder tolerates
//! frames split across reads and several frames per read; malformed lines
//! are dropped without disturbing the frames around them.

mod codec;
mod types;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameDecoder, decode_line, encode};
pub use types::*;
