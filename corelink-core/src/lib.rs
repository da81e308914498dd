//! Engine primitives shared by the corelink runtime: a zero-copy byte
//! buffer, lock-free fixed-capacity queues, a three-state life-cycle
//! lock, endpoint parsing, a reactor pool, and a timer service.
//!
//! These types are deliberately protocol- and session-agnostic; the
//! `corelink` crate builds the Socket/Channel/Session machinery on top
//! of them, and `corelink-proto` builds the wire codecs.

pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod reactor;
pub mod timer;

pub mod prelude {
    pub use crate::buffer::IoBuffer;
    pub use crate::endpoint::{EndPoint, EndpointError};
    pub use crate::error::CoreError;
    pub use crate::lifecycle::{LifeCycleLock, LifeCycleShareGuard};
    pub use crate::queue::{MpscQueue, SpscQueue};
    pub use crate::reactor::{EventHandler, Reactor, ReactorPool};
    pub use crate::timer::{TaskId, TimerService};
}
