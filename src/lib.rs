//! Flux - a portable toolkit of concurrency primitives: pools, bounded queues, a serial
//! dispatch queue, a notifier, finite state machines, a composite state-event loop, and
//! a framed asynchronous I/O transport.

pub mod asyncio;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod notifier;
pub mod platform;
pub mod pool;
pub mod queue;
pub mod state_machine;

pub use asyncio::{ AsyncIo, BlockingRead, BlockingWrite, SendStatus, TxToken };
pub use dispatch::{ DispatchQueue, RepeatHandle };
pub use error::{ FluxError, Result };
pub use event_loop::StateEventLoop;
pub use notifier::Notifier;
pub use platform::{ Deadline, EventFlag, Signal, WaitMode };
pub use pool::{ Pool, PoolRef };
pub use queue::BoundedQueue;
pub use state_machine::{ State, StateMachine, MAX_STATES };

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
