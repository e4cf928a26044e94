//! Sample `Handler` implementations demonstrating the contract described by
//! `enrichment_common::prelude`. These exist to exercise the runner end to
//! end; a real deployment registers its own handlers in their place.

mod account_enhance;
mod lead_fan_out;

use std::sync::Arc;

use enrichment_common::handler::Handler;

/// The default set of handlers wired into `enrichment-worker`'s registry.
pub fn handlers() -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(account_enhance::AccountEnhanceHandler),
        Arc::new(lead_fan_out::LeadFanOutHandler),
    ]
}
