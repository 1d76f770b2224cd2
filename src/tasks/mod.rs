//! Background tasks: revisibility sweeping, peer heartbeats, and the
//! cache consistency check. Each owns a shutdown receiver and stops with
//! the process.

mod consistency;
mod heartbeat;
mod sweeper;

pub use consistency::ConsistencyCheckTask;
pub use heartbeat::HeartbeatTask;
pub use sweeper::VisibilitySweeper;
