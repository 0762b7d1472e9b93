use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, ProductName};

/// Stages of one placement request, in order.
///
/// ```text
/// Received → InventoryVerified → Persisted → InventoryAdjusted → Completed
/// ```
///
/// `Persisted` is the commit point: a failure before it leaves no trace, a
/// failure after it leaves a recorded order whose remaining steps are retried
/// or compensated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStage {
    Received,
    InventoryVerified,
    Persisted,
    InventoryAdjusted,
    Completed,
}

impl PlacementStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementStage::Received => "received",
            PlacementStage::InventoryVerified => "inventory_verified",
            PlacementStage::Persisted => "persisted",
            PlacementStage::InventoryAdjusted => "inventory_adjusted",
            PlacementStage::Completed => "completed",
        }
    }
}

impl core::fmt::Display for PlacementStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated order request (stage `Received`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    pub product_name: ProductName,
    pub quantity: i64,
}

impl PlaceOrder {
    pub fn new(product_name: impl AsRef<str>, quantity: i64) -> DomainResult<Self> {
        let product_name = ProductName::parse(product_name)?;
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }
        Ok(Self {
            product_name,
            quantity,
        })
    }
}

/// Advisory availability check (stage `InventoryVerified`).
///
/// This can race with concurrent orders; the inventory store's guarded
/// decrement has the final word.
pub fn verify_availability(requested: i64, available: i64) -> DomainResult<()> {
    if requested > available {
        return Err(DomainError::conflict(format!(
            "insufficient inventory (requested: {requested}, available: {available})"
        )));
    }
    Ok(())
}
