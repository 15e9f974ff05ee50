use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::DEFAULT_SCAN_DURATION_SECS;
use crate::core::bluetooth::types::ScanResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Advertisements weaker than this are ignored. `None` accepts all,
    /// including reports without an RSSI.
    pub min_rssi: Option<i16>,

    /// Only keep peripherals whose advertised name contains this text
    pub name_filter: Option<String>,

    /// How long the demo runner scans before stopping
    pub scan_duration_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            min_rssi: None,
            name_filter: None,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
        }
    }
}

impl ScanConfig {
    /// Returns true if the scanner should record this result
    pub fn accepts(&self, result: &ScanResult) -> bool {
        if let Some(min_rssi) = self.min_rssi {
            match result.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }
        match &self.name_filter {
            Some(filter) => result
                .peripheral
                .name
                .as_ref()
                .map(|name| name.contains(filter.as_str()))
                .unwrap_or(false),
            None => true,
        }
    }
}
