//! Platform capability consumed by the session core.

/// Severity for platform-routed log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What the surrounding platform provides to the session core. The core
/// only consumes this; implementations live with the transport manager.
pub trait PlatformHandler: Send + Sync {
    /// Address advertised in transport-upgrade responses.
    fn local_ip(&self) -> String;

    /// Platform log sink. The default routes through `tracing`.
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "cdp::platform", "{}", message),
            LogLevel::Info => tracing::info!(target: "cdp::platform", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "cdp::platform", "{}", message),
            LogLevel::Error => tracing::error!(target: "cdp::platform", "{}", message),
        }
    }
}

/// Loopback-only platform for tests and single-machine demos.
pub struct LoopbackPlatform;

impl PlatformHandler for LoopbackPlatform {
    fn local_ip(&self) -> String {
        "127.0.0.1".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_platform() {
        let platform = LoopbackPlatform;
        assert_eq!(platform.local_ip(), "127.0.0.1");
        platform.log(LogLevel::Debug, "routed through tracing");
    }
}
