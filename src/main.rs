// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use command_runner_rs::{
    catalog::db::{DeviceSource, EmptyDeviceSource, JsonFileDeviceSource},
    cfg::{
        cli::{config_path_from_args, resolve_config_path},
        config::ServiceConfig,
        logger::init_default_logger,
    },
    service::{Service, ServiceParts},
};
use tracing::{info, warn};

fn main() -> Result<()> {
    let cfg = match resolve_config_path(&config_path_from_args()) {
        Ok(path) => ServiceConfig::load_from_file(&path)
            .with_context(|| format!("failed to load config {path:?}"))?,
        Err(_) => ServiceConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cfg.max_default_executor_threads)
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: ServiceConfig) -> Result<()> {
    let _logger_guard = init_default_logger(&cfg.log_level)?;
    info!("starting at {}", chrono::Utc::now().to_rfc3339());
    if cfg.runtime_debug {
        info!("runtime debug diagnostics enabled");
    }

    let source: Arc<dyn DeviceSource> = match &cfg.device_db_file {
        Some(path) => Arc::new(JsonFileDeviceSource::new(path.clone())),
        None => {
            warn!("no device_db_file configured; catalog lookups will all miss");
            Arc::new(EmptyDeviceSource)
        },
    };

    let service = Service::new(cfg, ServiceParts::production(source))?;
    service.start_background_tasks();

    // Serve nothing before the first inventory fetch lands.
    service.catalog.wait_for_data().await;
    info!(
        "service ready: port={} devices={}",
        service.cfg.port,
        service.catalog.len()
    );

    service.run_until_shutdown().await
}
