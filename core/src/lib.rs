//! Framing, header compression, and the endpoints/pipeline that bridge a
//! TUN interface to a point-to-point serial link.

pub mod compression;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod pipeline;
pub mod serial;
pub mod tun;

pub use compression::{CompressionContext, ExpandOutcome, RohcError, ShrinkOutcome};
pub use endpoint::RawEndpoint;
pub use error::{FatalReason, LoopError, LoopResult, LoopResultExt};
pub use framing::{Deframer, Framer, FLAG, ESC, MAX_FRAME_SIZE, MAX_PACKET_SIZE};
pub use pipeline::{Pipeline, PipelineConfig, State as PipelineState, StopHandle};
pub use serial::{SerialEndpoint, DEFAULT_BAUD};
pub use tun::TunEndpoint;
