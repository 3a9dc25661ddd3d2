//! Product cache seeding.
//!
//! A fresh terminal has an empty product cache. On start-up it fetches the
//! catalogue once; afterwards products only change through `setProducts`
//! mutations delivered by sync.

use tracing::{info, warn};

use crate::api::SyncTransport;
use crate::error::PosError;
use crate::projector::StateProjector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    AlreadyCached(usize),
    Seeded(usize),
    /// Server unreachable; the cache stays empty until a later sync.
    Deferred,
}

/// Fill the product cache from the server if it is empty.
pub async fn init_products(
    projector: &StateProjector,
    transport: &dyn SyncTransport,
) -> Result<SeedOutcome, PosError> {
    let cached = projector.products()?.len();
    if cached > 0 {
        return Ok(SeedOutcome::AlreadyCached(cached));
    }

    match transport.fetch_products().await {
        Ok(products) => {
            projector.replace_products(&products)?;
            info!(count = products.len(), "Product cache seeded from server");
            Ok(SeedOutcome::Seeded(products.len()))
        }
        Err(e) if e.is_transient() => {
            warn!(error = %e, "Product fetch failed; starting with an empty catalogue");
            Ok(SeedOutcome::Deferred)
        }
        Err(e) => Err(e),
    }
}
