pub mod controller;
pub mod loop_worker;

pub use controller::PollController;
pub use loop_worker::{poll_loop, run_tick};
