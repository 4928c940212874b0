// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    api::error::{Result, SessionError},
    catalog::{
        device::{DeviceInfo, DeviceRecordData, PingCheck},
        vendor::VendorRegistry,
    },
    cfg::config::ServiceConfig,
};

/// Backend access to the external inventory. Adapt this to fetch devices
/// from your own system of record.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Fetches device records. `hostname` narrows the fetch to one device;
    /// `name_filter` restricts a full fetch to matching names.
    async fn fetch(
        &self,
        name_filter: Option<&regex::Regex>,
        hostname: Option<&str>,
    ) -> Result<Vec<DeviceRecordData>>;
}

/// Reads the device list from a JSON file. This stands in for a real
/// inventory backend in small deployments and demos.
pub struct JsonFileDeviceSource {
    path: PathBuf,
}

impl JsonFileDeviceSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl DeviceSource for JsonFileDeviceSource {
    async fn fetch(
        &self,
        name_filter: Option<&regex::Regex>,
        hostname: Option<&str>,
    ) -> Result<Vec<DeviceRecordData>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SessionError::runtime(format!("Cannot read device db: {e}")))?;
        let records: Vec<DeviceRecordData> = serde_json::from_str(&raw)
            .map_err(|e| SessionError::runtime(format!("Cannot parse device db: {e}")))?;
        Ok(records
            .into_iter()
            .filter(|r| hostname.is_none_or(|h| r.hostname == h))
            .filter(|r| name_filter.is_none_or(|f| f.is_match(&r.hostname)))
            .collect())
    }
}

/// A source with no devices; lookups always miss.
pub struct EmptyDeviceSource;

#[async_trait]
impl DeviceSource for EmptyDeviceSource {
    async fn fetch(
        &self,
        _name_filter: Option<&regex::Regex>,
        _hostname: Option<&str>,
    ) -> Result<Vec<DeviceRecordData>> {
        Ok(Vec::new())
    }
}

/// Read-through cache of device records keyed by hostname and alias.
///
/// A periodic task refreshes the whole set; point lookups that miss trigger
/// a single-device backend fetch. Records are replaced atomically on
/// refresh, and a failed refresh keeps the current snapshot.
pub struct DeviceCatalog {
    devices: DashMap<String, Arc<DeviceInfo>>,
    source: Arc<dyn DeviceSource>,
    vendors: Arc<VendorRegistry>,
    name_filter: Option<regex::Regex>,
    update_interval: Duration,
    data_valid_tx: watch::Sender<bool>,
}

impl DeviceCatalog {
    pub fn new(
        cfg: &ServiceConfig,
        source: Arc<dyn DeviceSource>,
        vendors: Arc<VendorRegistry>,
    ) -> Self {
        let (data_valid_tx, _) = watch::channel(false);
        Self {
            devices: DashMap::new(),
            source,
            vendors,
            name_filter: cfg.name_filter(),
            update_interval: cfg.device_db_update_interval,
            data_valid_tx,
        }
    }

    pub fn data_valid(&self) -> bool {
        *self.data_valid_tx.borrow()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Blocks until the first successful full fetch completes.
    pub async fn wait_for_data(&self) {
        let mut rx = self.data_valid_tx.subscribe();
        while !*rx.borrow_and_update() {
            info!("Waiting for device data");
            if rx.changed().await.is_err() {
                return;
            }
        }
        info!("Device data valid");
    }

    /// Gets a device record: local cache first, then a single-device backend
    /// fetch when `autofetch` is set.
    pub async fn get(&self, hostname: &str, autofetch: bool) -> Result<Arc<DeviceInfo>> {
        if !self.devices.contains_key(hostname) && autofetch {
            self.fetch_into_cache(Some(hostname)).await?;
        }

        self.devices
            .get(hostname)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::lookup(format!("Device not found: {hostname}")))
    }

    /// One full refresh pass. Failures are logged and the snapshot kept.
    pub async fn refresh_once(&self) {
        match self.fetch_into_cache(None).await {
            Ok(()) => {
                self.data_valid_tx.send_replace(true);
            },
            Err(e) => {
                error!("Failed to fetch device info, error message: {e}");
            },
        }
    }

    /// Periodic refresh driven by `device_db_update_interval`.
    pub async fn refresh_loop(&self, cancel: CancellationToken) {
        loop {
            self.refresh_once().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.update_interval) => {},
            }
        }
    }

    async fn fetch_into_cache(&self, hostname: Option<&str>) -> Result<()> {
        let filter = if hostname.is_none() {
            self.name_filter.as_ref()
        } else {
            None
        };
        let records = self.source.fetch(filter, hostname).await?;
        for data in records {
            let vendor = self.vendors.get(&data.vendor);
            let alias = data.alias.clone();
            let record = Arc::new(DeviceInfo::new(data, vendor));
            if let Some(alias) = alias {
                self.devices.insert(alias, record.clone());
            }
            self.devices.insert(record.hostname().to_string(), record);
        }
        Ok(())
    }
}

impl PingCheck for DeviceCatalog {}
