//! The measurement flows: the scheduler (C5), which drives one tunneled
//! and one direct TCP flow per peer, and the server (C6), which answers
//! both on the private and public addresses.

mod scheduler;
mod server;
mod socket;

pub use scheduler::{run_scheduler, FlowResult, ScheduleMode};
pub use server::spawn_listeners;
