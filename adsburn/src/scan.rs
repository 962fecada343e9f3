//! BLE sighting source.
//!
//! Target devices advertise a name containing one of the configured
//! substrings. The scanner keeps the host adapter scanning and periodically
//! sweeps the discovered-peripheral list, handing every matching
//! advertisement to the factory as a [`Sighting`]. Deduplication is not the
//! scanner's job: the factory's processing set and progress map decide what
//! a repeated sighting means, and released devices rely on being sighted
//! again.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::error::{Error, Result};

pub use btleplug::platform::Adapter;

/// Interval between sweeps of the discovered-peripheral list.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One advertisement of a target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Advertised local name.
    pub name: String,
    /// Peer MAC address.
    pub mac: String,
    /// Signal strength at sighting time, when the stack reports it.
    pub rssi: Option<i16>,
}

/// Acquire the first Bluetooth adapter on the host.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config("no Bluetooth adapter found".into()))?;
    Ok(adapter)
}

/// Scan for target devices until `quit` flips to true.
///
/// `on_sighting` runs on every sweep for every currently visible match, so
/// the same device is reported repeatedly while it keeps advertising.
pub async fn run_sighting_scan(
    adapter: Adapter,
    target_ids: Vec<String>,
    mut quit: watch::Receiver<bool>,
    mut on_sighting: impl FnMut(Sighting),
) -> Result<()> {
    adapter.start_scan(ScanFilter::default()).await?;
    info!("BLE scan started (targets: {target_ids:?})");

    loop {
        tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
            },
            () = tokio::time::sleep(SWEEP_INTERVAL) => {
                sweep(&adapter, &target_ids, &mut on_sighting).await;
            },
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!("stop_scan failed: {e}");
    }
    info!("BLE scan stopped");
    Ok(())
}

/// Report every currently visible target device.
async fn sweep(
    adapter: &Adapter,
    target_ids: &[String],
    on_sighting: &mut impl FnMut(Sighting),
) {
    let peripherals = match adapter.peripherals().await {
        Ok(list) => list,
        Err(e) => {
            warn!("peripheral sweep failed: {e}");
            return;
        },
    };

    for peripheral in peripherals {
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            Ok(None) => continue,
            Err(e) => {
                debug!("properties read failed: {e}");
                continue;
            },
        };
        let Some(name) = props.local_name else {
            continue;
        };
        if !matches_target(&name, target_ids) {
            continue;
        }
        on_sighting(Sighting {
            name,
            mac: props.address.to_string(),
            rssi: props.rssi,
        });
    }
}

/// Whether an advertised name matches any configured target substring.
pub fn matches_target(name: &str, target_ids: &[String]) -> bool {
    !name.is_empty() && target_ids.iter().any(|target| name.contains(target))
}
