//! Background loops driving the queue.

mod promoter;
mod sweeper;

pub use promoter::spawn_promoter;
pub use sweeper::spawn_sweeper;
