//! ICE configuration provider
//!
//! Supplies the STUN/TURN endpoint list to each joining client. The
//! configuration is handed out once per join; clients do not re-fetch
//! mid-session unless they explicitly ask for a refresh.

use crate::SignalingConfig;
use meshvoice_core::IceConfiguration;

/// Provider of the ICE server set.
pub struct IceConfigProvider {
    configuration: IceConfiguration,
}

impl IceConfigProvider {
    /// Build the provider from server configuration. The static STUN
    /// fallback list is applied when no STUN endpoints are configured.
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            configuration: config.ice_configuration(),
        }
    }

    /// The ICE configuration for a joining client.
    pub fn configuration(&self) -> IceConfiguration {
        self.configuration.clone()
    }
}
