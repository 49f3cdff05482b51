pub mod broker;
pub mod envelope;
pub mod frame;
pub mod index;
pub mod registry;
pub mod router;
pub mod storage;

pub use broker::{Broker, HEARTBEAT_ADVERTISED, STOMP_VERSION};
pub use envelope::{ChatRecord, InboundChat, OutboundChat};
pub use frame::{Command, DecodeError, Frame};
pub use registry::{ConnectionId, Outbound, OutboundSender};
pub use router::{DestinationRouter, ONLINE_USERS_CHANNEL};
pub use storage::{ChatStore, MemoryChatStore};
