//! Best-effort failure diagnostics.
//!
//! All four probes run in parallel; any probe failure is absorbed and
//! its slot omitted, so diagnostic capture can never replace or mask
//! the primary failure.

use crate::driver::{BrowserDriver, ConsoleEntry, NetworkEntry};
use tracing::warn;

/// Captured failure context.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Console messages, newest first.
    pub console_log: Vec<ConsoleEntry>,

    /// Network responses, newest first.
    pub network_log: Vec<NetworkEntry>,

    pub dom_snapshot: Option<String>,

    /// Base64 PNG.
    pub screenshot: Option<String>,
}

/// Probe the driver for console log, network log, DOM snapshot and a
/// screenshot, in parallel, absorbing per-probe failures.
pub async fn capture(driver: &dyn BrowserDriver) -> Diagnostics {
    let (console, network, dom, screenshot) = tokio::join!(
        driver.get_console_messages(),
        driver.get_network_responses(),
        driver.get_dom_snapshot(),
        driver.capture_screenshot(),
    );

    let mut console_log = match console {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "Console capture failed");
            Vec::new()
        }
    };
    console_log.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut network_log = match network {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "Network capture failed");
            Vec::new()
        }
    };
    network_log.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    Diagnostics {
        console_log,
        network_log,
        dom_snapshot: match dom {
            Ok(html) => Some(html),
            Err(err) => {
                warn!(error = %err, "DOM snapshot capture failed");
                None
            }
        },
        screenshot: match screenshot {
            Ok(png) => Some(png),
            Err(err) => {
                warn!(error = %err, "Screenshot capture failed");
                None
            }
        },
    }
}
