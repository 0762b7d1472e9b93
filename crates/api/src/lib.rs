//! HTTP services: the inventory service, the order service, and the pieces
//! that connect them (inventory client, adjusters, outbox publisher).

pub mod adjuster;
pub mod app;
pub mod inventory_client;
pub mod inventory_service;
pub mod order_service;
pub mod publisher;
