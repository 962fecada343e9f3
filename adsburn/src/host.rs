//! Host-side dongle discovery.
//!
//! The production dongles enumerate as CP210x USB-to-serial bridges; the
//! USB product string is the only reliable marker across OS platforms, so
//! discovery filters on it rather than on VID/PID tables.

use log::{debug, info};

use crate::error::Result;

/// Product-string markers identifying a flashing dongle (upper-cased).
pub const DONGLE_PRODUCT_MARKERS: [&str; 2] = ["SILICON LABS", "CP210X"];

/// Check whether a USB product string belongs to a dongle.
pub fn is_dongle_product(product: &str) -> bool {
    let upper = product.to_uppercase();
    DONGLE_PRODUCT_MARKERS
        .iter()
        .any(|marker| upper.contains(marker))
}

/// List the serial ports of all attached flashing dongles.
pub fn find_dongle_ports() -> Result<Vec<String>> {
    info!("scanning serial ports for dongles...");
    let ports = serialport::available_ports()?;

    let mut found = Vec::new();
    for port in ports {
        let serialport::SerialPortType::UsbPort(usb) = &port.port_type else {
            debug!("skipping non-USB port {}", port.port_name);
            continue;
        };
        let product = usb.product.as_deref().unwrap_or("");
        debug!(
            "found {} | product: {product} | {:04X}:{:04X}",
            port.port_name, usb.vid, usb.pid
        );
        if is_dongle_product(product) {
            info!("dongle identified: {} ({product})", port.port_name);
            found.push(port.port_name);
        }
    }
    info!("scan complete: {} dongle(s)", found.len());
    Ok(found)
}
