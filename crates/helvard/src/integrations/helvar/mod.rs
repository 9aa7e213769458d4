pub mod address;
mod client;
mod config;
#[allow(clippy::module_inception)]
mod helvar;
mod light;
mod protocol;
mod router;
mod subscription;

use std::time::Duration;

pub use client::DEFAULT_PORT;
pub use client::HelvarNetRouter;
pub use config::Config as HelvarConfig;
pub use helvar::HelvarIntegration;
use linkme::distributed_slice;
use tracing::info;

use crate::engine;

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_helvar(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let mut integrations: Vec<Box<dyn engine::Integration>> = Vec::new();

    for (entry_id, config) in &ctx.config.integrations.helvar {
        if !config.enabled {
            info!("Helvar entry {} is disabled, skipping", entry_id);
            continue;
        }

        let router = HelvarNetRouter::new(config.host.clone(), DEFAULT_PORT)
            .with_poll_interval(Duration::from_secs(config.poll_interval_secs));
        integrations.push(Box::new(HelvarIntegration::new(
            entry_id,
            config,
            DEFAULT_PORT,
            router,
        )));
    }

    Ok(integrations)
}
