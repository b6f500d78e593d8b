//! Well-known condition types, reasons and phases.

pub const READY: &str = "Ready";
pub const PROVISIONING_SUCCEEDED: &str = "ProvisioningSucceeded";
pub const DEPLOYMENTS_AVAILABLE: &str = "DeploymentsAvailable";
pub const COMPONENTS_READY: &str = "ComponentsReady";
pub const CAPABILITY_SERVICE_MESH: &str = "CapabilityServiceMesh";
pub const CAPABILITY_SERVICE_MESH_AUTHORIZATION: &str = "CapabilityServiceMeshAuthorization";

// Feature tracker conditions
pub const PROGRESSING: &str = "Progressing";
pub const AVAILABLE: &str = "Available";
pub const DEGRADED: &str = "Degraded";

pub const REASON_ERROR: &str = "Error";
pub const REASON_STOPPED: &str = "Stopped";
pub const REASON_DEPLOYMENTS_NOT_READY: &str = "DeploymentsNotReady";

pub const PHASE_READY: &str = "Ready";
pub const PHASE_NOT_READY: &str = "Not Ready";
pub const PHASE_ERROR: &str = "Error";
pub const PHASE_PROGRESSING: &str = "Progressing";
