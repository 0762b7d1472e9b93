use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, Entity, ProductName};

/// Inventory record: one sellable product and its on-hand quantity.
///
/// `quantity` is never negative; every mutation goes through [`apply_delta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: ProductName,
    pub description: String,
    /// Unit price in the smallest currency unit (e.g. cents).
    pub price: u64,
    pub quantity: i64,
}

impl Entity for Product {
    type Id = ProductName;
    const KIND: &'static str = "product";

    fn id(&self) -> &Self::Id {
        &self.name
    }
}

/// Validated product registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: ProductName,
    pub description: String,
    pub price: u64,
    pub quantity: i64,
}

impl NewProduct {
    pub fn new(
        name: impl AsRef<str>,
        description: impl Into<String>,
        price: u64,
        quantity: i64,
    ) -> DomainResult<Self> {
        let name = ProductName::parse(name)?;
        if quantity < 0 {
            return Err(DomainError::validation("initial quantity cannot be negative"));
        }
        if price > i64::MAX as u64 {
            return Err(DomainError::validation("price is out of range"));
        }
        Ok(Self {
            name,
            description: description.into(),
            price,
            quantity,
        })
    }

    pub fn into_product(self) -> Product {
        Product {
            name: self.name,
            description: self.description,
            price: self.price,
            quantity: self.quantity,
        }
    }
}

/// A requested change to on-hand quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Adjustment(i64);

impl Adjustment {
    pub fn new(delta: i64) -> DomainResult<Self> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        Ok(Self(delta))
    }

    /// Decrement for an order of `quantity` units.
    pub fn decrement(quantity: i64) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }
        Ok(Self(-quantity))
    }

    pub fn delta(self) -> i64 {
        self.0
    }
}

/// The underflow guard: quantity after applying `delta`, or the reason it is refused.
///
/// Never clamps. A result below zero is `WouldUnderflow`; an arithmetic
/// overflow is a validation error.
pub fn apply_delta(available: i64, delta: i64) -> DomainResult<i64> {
    let next = available
        .checked_add(delta)
        .ok_or_else(|| DomainError::validation("quantity overflow"))?;
    if next < 0 {
        return Err(DomainError::WouldUnderflow { available, delta });
    }
    Ok(next)
}
