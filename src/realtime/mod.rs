//! Real-time channel
//!
//! One push connection per process, tracked through
//! `disconnected → connecting → connected`, with a heartbeat health probe while
//! connected and an ordered fan-out of named events to listeners. Payloads are
//! passed through uninterpreted.

mod channel;
mod listeners;
mod status;
mod transport;

pub use channel::{ChannelConfig, RealtimeChannel};
pub use listeners::{ListenerRegistry, Subscription};
pub use status::{ConnectionState, ConnectionStatus};
pub use transport::{FrameStream, LocalEmitter, LocalTransport, PushFrame, PushTransport};
