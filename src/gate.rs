//! Host permission/resource gate
//!
//! The engine treats "permission denied" as a first-class failure path, so
//! capability checks sit behind a trait rather than being probed ad hoc.

/// Boolean capability checks supplied by the host platform
pub trait PermissionGate: Send + Sync {
    /// Whether microphone capture is allowed
    fn can_record_audio(&self) -> bool;

    /// Whether audio output settings may be modified
    fn can_modify_audio_settings(&self) -> bool;
}

/// Desktop host gate
///
/// Grants everything unless explicitly denied via `TIDYBOT_DENY_MIC`, which
/// exists so headless deployments can exercise the permission failure path.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostGate;

impl PermissionGate for HostGate {
    fn can_record_audio(&self) -> bool {
        !std::env::var("TIDYBOT_DENY_MIC").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }

    fn can_modify_audio_settings(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_gate_allows_audio_settings() {
        assert!(HostGate.can_modify_audio_settings());
    }
}
