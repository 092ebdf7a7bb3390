//! Power-flow apportionment and energy accounting

pub mod accumulator;
pub mod flow;
pub mod store;

pub use accumulator::{accumulate, EnergyCounter, EnergyState};
pub use flow::{derive_flows, PowerSnapshot};
pub use store::EnergyStore;
