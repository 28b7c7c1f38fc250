pub mod backoff;
pub mod bridge;
pub mod broker;
pub mod hub;
pub mod membership;

pub use bridge::Bridge;
pub use broker::{Broker, BrokerError, MemoryBroker};
pub use hub::{Connection, Hub};
pub use membership::{Denial, Gate, GateError, RoomDirectory, SendKind};
