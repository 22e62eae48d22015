/// Resource-change notifications fanned out to subscribers (the
/// reconciler, any external watcher). Mirrors mvirt-api's `Event` enum.
#[derive(Debug, Clone)]
pub enum Event {
    NetworkCreated { id: String },
    NetworkDeleted { id: String },
    VmCreated { id: String },
    VmStatusUpdated { id: String },
    VmDeleted { id: String },
    SpareProvisioned { id: String },
    SpareAcquired { id: String, mission_id: String },
    SpareReleased { id: String },
    SpareStatusChanged { id: String },
    DriftDetected { resource_id: String },
}

impl Event {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Event::NetworkCreated { .. } | Event::NetworkDeleted { .. } => "network",
            Event::VmCreated { .. } | Event::VmStatusUpdated { .. } | Event::VmDeleted { .. } => {
                "vm"
            }
            Event::SpareProvisioned { .. }
            | Event::SpareAcquired { .. }
            | Event::SpareReleased { .. }
            | Event::SpareStatusChanged { .. } => "hot_spare",
            Event::DriftDetected { .. } => "drift",
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            Event::NetworkCreated { id }
            | Event::NetworkDeleted { id }
            | Event::VmCreated { id }
            | Event::VmStatusUpdated { id }
            | Event::VmDeleted { id }
            | Event::SpareProvisioned { id }
            | Event::SpareAcquired { id, .. }
            | Event::SpareReleased { id }
            | Event::SpareStatusChanged { id } => id,
            Event::DriftDetected { resource_id } => resource_id,
        }
    }
}
