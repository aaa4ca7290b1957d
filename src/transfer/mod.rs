//! HTTP transfer plumbing shared by the storage backends: Range parsing,
//! conditional requests, header relay for proxied media, and response sinks.

pub mod conditional;
pub mod range;
pub mod relay;
pub mod sink;

pub use range::{parse_range, ByteRange};
pub use sink::{channel, BufferedSink, ChannelSink, PendingResponse, ResponseHead, ResponseSink};
