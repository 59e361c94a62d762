//! 异步消息总线：主题 + 消费组，至少一次投递，组内有序

pub mod envelope;
pub mod memory_bus;

pub use envelope::{topic, BusMessage, Envelope, Priority};
pub use memory_bus::{InProcessBus, MessageBus, Subscription};
