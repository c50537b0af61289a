//! Orders and their status.

mod model;
mod state;

pub use model::Order;
pub use state::OrderStatus;
