//! mDNS service advertisement
//!
//! Advertises the satellite using mDNS (multicast DNS) so that controllers
//! on the local network find it without manual configuration
//!
//! Service type: `_vaca._tcp.local.`
//! Instance name: `vaca-{device_id}`
//!
//! TXT records:
//! - `version`: Satellite version
//! - `device_id`: Persisted device id

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::RwLock;

use crate::{Error, Result};

/// mDNS service type for voice satellites
pub const SERVICE_TYPE: &str = "_vaca._tcp.local.";

/// Instance name advertised for `device_id`
#[must_use]
pub fn instance_name(device_id: &str) -> String {
    format!("vaca-{device_id}")
}

/// TXT record properties for the advertisement
#[must_use]
pub fn txt_properties(device_id: &str, version: &str) -> HashMap<String, String> {
    HashMap::from([
        ("version".to_string(), version.to_string()),
        ("device_id".to_string(), device_id.to_string()),
    ])
}

/// mDNS advertiser for satellite discovery
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    device_id: String,
    version: String,

    /// Full name of the registered service, if any
    registered_service: RwLock<Option<String>>,
}

impl MdnsAdvertiser {
    /// Create an advertiser for this device
    ///
    /// # Errors
    ///
    /// Returns error if the mDNS daemon cannot be created
    pub fn new(device_id: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("failed to create mDNS daemon: {e}")))?;

        Ok(Self {
            daemon,
            device_id: device_id.into(),
            version: version.into(),
            registered_service: RwLock::new(None),
        })
    }

    /// Start advertising the satellite on `port`
    ///
    /// Registering again replaces the previous advertisement.
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be registered
    pub async fn register(&self, port: u16) -> Result<()> {
        self.unregister().await;

        let instance = instance_name(&self.device_id);
        let hostname = hostname::get()
            .map_or_else(|_| "vaca".to_string(), |h| h.to_string_lossy().to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{hostname}.local."),
            "",
            port,
            txt_properties(&self.device_id, &self.version),
        )
        .map_err(|e| Error::Discovery(format!("failed to create service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| Error::Discovery(format!("failed to register mDNS service: {e}")))?;

        *self.registered_service.write().await = Some(fullname);

        tracing::info!(
            service_type = SERVICE_TYPE,
            instance = %instance,
            port,
            "mDNS service registered"
        );

        Ok(())
    }

    /// Stop advertising
    pub async fn unregister(&self) {
        let fullname = self.registered_service.write().await.take();

        if let Some(name) = fullname {
            if let Err(e) = self.daemon.unregister(&name) {
                tracing::warn!(error = %e, "failed to unregister mDNS service");
            } else {
                tracing::info!("mDNS service unregistered");
            }
        }
    }

    /// Check if currently advertising
    pub async fn is_advertising(&self) -> bool {
        self.registered_service.read().await.is_some()
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        if let Some(name) = self.registered_service.get_mut().take() {
            let _ = self.daemon.unregister(&name);
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_format() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.contains("._tcp."));
    }

    #[test]
    fn test_instance_and_txt() {
        assert_eq!(instance_name("a1b2c3d4"), "vaca-a1b2c3d4");

        let txt = txt_properties("a1b2c3d4", "0.1.0");
        assert_eq!(txt.len(), 2);
        assert_eq!(txt["device_id"], "a1b2c3d4");
        assert_eq!(txt["version"], "0.1.0");
    }

    #[tokio::test]
    async fn test_advertiser_creation() {
        // mDNS may be unavailable in sandboxed environments
        if let Ok(advertiser) = MdnsAdvertiser::new("a1b2c3d4", "0.1.0") {
            assert!(!advertiser.is_advertising().await);
            advertiser.unregister().await;
            assert!(!advertiser.is_advertising().await);
        }
    }
}
