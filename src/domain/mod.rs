pub mod audit;
pub mod market;
pub mod missed_data;
pub mod state;
pub mod strategy;

pub use audit::*;
pub use market::*;
pub use missed_data::*;
pub use state::*;
pub use strategy::*;
