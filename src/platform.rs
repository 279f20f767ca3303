//! Read-once platform identity.
//!
//! Everything here is read exactly once, at first access outside the control
//! loop; the core never touches filesystem paths while running.

use once_cell::sync::OnceCell;

#[derive(Debug, Clone, Default)]
pub struct PlatformInfo {
    /// Stable machine identifier, if the platform provides one.
    pub machine_id: Option<String>,
    /// Installation/portal identifier used by the surrounding ecosystem.
    pub portal_id: Option<String>,
}

static PLATFORM: OnceCell<PlatformInfo> = OnceCell::new();

impl PlatformInfo {
    pub fn get() -> &'static PlatformInfo {
        PLATFORM.get_or_init(|| PlatformInfo {
            machine_id: read_trimmed("/etc/machine-id"),
            portal_id: std::env::var("OIC_PORTAL_ID").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_info_is_cached() {
        let a = PlatformInfo::get() as *const _;
        let b = PlatformInfo::get() as *const _;
        assert_eq!(a, b);
    }
}
