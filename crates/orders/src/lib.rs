//! Order domain module.
//!
//! The order record, its status lifecycle, and the validation and
//! availability rules of the placement workflow. Pure logic; the order
//! service in `orderflow-api` drives the IO around it.

pub mod events;
pub mod order;
pub mod placement;

pub use events::OrderEvent;
pub use order::{Order, OrderStatus, Transition};
pub use placement::{PlaceOrder, PlacementStage, verify_availability};
