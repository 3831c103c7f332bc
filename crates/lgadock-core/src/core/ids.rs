use slotmap::new_key_type;

new_key_type! {
    pub struct BufferId;
}

/// Logical device id; the scheduler orders devices by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}
