use proto::{EndpointAddress, Envelope};

/// Chooses the local bus endpoint for an inbound envelope. Resolution never fails.
pub trait EndpointRouter: Send + Sync {
    fn resolve(&self, envelope: &Envelope) -> EndpointAddress;
}

/// Routes everything to the main input address of the local endpoint
#[derive(Debug, Clone)]
pub struct DefaultEndpointRouter {
    main_input: EndpointAddress,
}

impl DefaultEndpointRouter {
    pub fn new(main_input: impl Into<EndpointAddress>) -> Self {
        Self {
            main_input: main_input.into(),
        }
    }

    pub fn main_input(&self) -> &EndpointAddress {
        &self.main_input
    }
}

impl EndpointRouter for DefaultEndpointRouter {
    fn resolve(&self, _envelope: &Envelope) -> EndpointAddress {
        self.main_input.clone()
    }
}

#[cfg(test)]
mod tests {
    use proto::headers;

    use super::*;

    #[test]
    fn default_router_always_returns_main_input() {
        let router = DefaultEndpointRouter::new("Sales");
        let plain = Envelope::new("SiteA", b"a".to_vec());
        let typed = Envelope::new("SiteB", b"b".to_vec())
            .with_header(headers::MESSAGE_TYPE, "Billing.InvoiceCreated");
        assert_eq!(router.resolve(&plain).as_str(), "Sales");
        assert_eq!(router.resolve(&typed), *router.main_input());
    }
}
