// Module: Ops
// Capability trait and the per-device-type operation registry.

pub mod redfish;
pub mod wait;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceType;
use crate::devices::{DeviceHandle, DeviceLogs};

/// Per-invocation context handed to every capability.
///
/// The deadline comes from the step's `timeout_seconds`; honoring it is the
/// capability's job. The cancellation token is shared with the whole engine.
pub struct OpContext {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub log: Arc<DeviceLogs>,
}

/// Trait that defines the contract for any device operation.
/// New capabilities (vendor tools, SSH-backed operations) plug in here.
///
/// O trait requer Send + Sync para suportar execução paralela de flows.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Name the operation is registered under.
    fn name(&self) -> &str;

    /// Runs the operation against one device. `Ok(())` means success;
    /// the error message of `Err` feeds the retry loop and telemetry.
    async fn invoke(
        &self,
        device: &DeviceHandle,
        parameters: &serde_json::Value,
        ctx: &OpContext,
    ) -> Result<()>;
}

/// Static dispatch table `(device_type, operation) → capability`.
/// Populated once at program start; immutable afterwards.
pub struct OperationRegistry {
    map: HashMap<(DeviceType, String), Arc<dyn Capability>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn register(&mut self, device_type: DeviceType, capability: Arc<dyn Capability>) {
        self.map
            .insert((device_type, capability.name().to_string()), capability);
    }

    pub fn get(&self, device_type: DeviceType, operation: &str) -> Option<Arc<dyn Capability>> {
        self.map
            .get(&(device_type, operation.to_string()))
            .map(Arc::clone)
    }

    pub fn contains(&self, device_type: DeviceType, operation: &str) -> bool {
        self.map.contains_key(&(device_type, operation.to_string()))
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the registry with the built-in operations for both device types.
pub fn builtin_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();

    for device_type in [DeviceType::Compute, DeviceType::Switch] {
        registry.register(device_type, Arc::new(redfish::ShowVersion));
        registry.register(device_type, Arc::new(redfish::UpdateFirmware));
        registry.register(device_type, Arc::new(redfish::PowerCycle));
        registry.register(device_type, Arc::new(redfish::WaitTask));
        registry.register(device_type, Arc::new(wait::WaitOperation));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_both_types() {
        let registry = builtin_registry();

        for device_type in [DeviceType::Compute, DeviceType::Switch] {
            assert!(registry.contains(device_type, "show_version"));
            assert!(registry.contains(device_type, "update_firmware"));
            assert!(registry.contains(device_type, "power_cycle"));
            assert!(registry.contains(device_type, "wait_task"));
            assert!(registry.contains(device_type, "wait"));
        }

        assert!(!registry.contains(DeviceType::Compute, "flash_bios"));
    }
}
