//! Line item quantity correction for sale documents.
//!
//! Upstream serialization sometimes underflows a quantity to something like
//! `4e-7` while price and sum stay intact. Fiscal printers reject such lines,
//! so the `sum / price` ratio is taken as the real quantity whenever the
//! recorded one disagrees with it.

use crate::{DocType, Item, TerminalRequest};

/// Quantities below this are treated as corrupted.
pub const MIN_QUANTITY: f64 = 1e-4;

/// Allowed drift between the recorded quantity and `sum / price`.
pub const QUANTITY_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct QuantityCorrection {
    pub index: usize,
    pub previous: Option<f64>,
    pub corrected: f64,
}

/// Returns the quantity `item` should carry, or `None` when it is fine as is
/// or cannot be derived (non-positive price or sum).
pub fn expected_quantity(item: &Item) -> Option<f64> {
    let price = item.price().filter(|price| *price > 0.0)?;
    let sum = item.sum().filter(|sum| *sum > 0.0)?;
    let expected = sum / price;
    let quantity = item.quantity().unwrap_or(0.0);
    if quantity < MIN_QUANTITY || (quantity - expected).abs() > QUANTITY_TOLERANCE {
        Some(expected)
    } else {
        None
    }
}

/// Rewrites corrupted quantities on a `sale` document in place. Other
/// document kinds are left untouched.
pub fn sanitize_sale_quantities(request: &mut TerminalRequest) -> Vec<QuantityCorrection> {
    if request.doc_type() != Some(&DocType::Sale) {
        return Vec::new();
    }
    let Some(items) = request.items_mut() else {
        return Vec::new();
    };

    let mut corrections = Vec::new();
    for (index, item) in items.iter_mut().enumerate() {
        if let Some(corrected) = expected_quantity(item) {
            corrections.push(QuantityCorrection {
                index,
                previous: item.quantity(),
                corrected,
            });
            item.set_quantity(corrected);
        }
    }
    corrections
}
