mod common;

pub mod bus;
pub mod icmp;
pub mod outcome;
pub mod persist;
pub mod prober;
pub mod settings;
pub mod stats;
pub mod store;
pub mod supervisor;
