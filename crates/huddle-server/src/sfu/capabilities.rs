use crate::relay::RelayRouter;
use huddle_protocol::RtpCapabilities;
use std::sync::Arc;

/// Serves the router's negotiable codecs
///
/// The descriptor is captured once when the router is created and never
/// changes afterwards.
pub struct CapabilityService {
    capabilities: Arc<RtpCapabilities>,
}

impl CapabilityService {
    pub fn new(router: &dyn RelayRouter) -> Self {
        Self {
            capabilities: Arc::new(router.rtp_capabilities()),
        }
    }

    pub fn get_capabilities(&self) -> RtpCapabilities {
        self.capabilities.as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MediaCodecConfig;
    use crate::relay::loopback::LoopbackRouter;

    #[test]
    fn test_capabilities_are_stable() {
        let router = LoopbackRouter::new(&MediaCodecConfig::defaults()).unwrap();
        let service = CapabilityService::new(&router);

        let first = service.get_capabilities();
        let second = service.get_capabilities();
        assert_eq!(first, second);
        assert_eq!(first, router.rtp_capabilities());
    }
}
