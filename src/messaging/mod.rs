pub mod broker;
pub mod distributor;
pub mod event;

pub use broker::MessageBroker;
pub use distributor::{Delivery, RealtimeDistributor, Subscription, TableFilter};
pub use event::{ChangeEvent, ChangeOp, EventType, Table};
