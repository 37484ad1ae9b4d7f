use crate::{classify::DeliveryError, delivery::Delivery, headers::Headers};
use async_trait::async_trait;

/// What a fetch hook decided about a freshly leased delivery.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    Deliver,
    /// Release the lease without an attempt; the reason lands in the log.
    Suppress { reason: String },
}

/// Hook points offered to plugins. Implementations run in-process; the
/// engine only defines where they are called:
///
/// - `sender_fetch` after a delivery is leased, before the speedometer;
/// - `sender_headers` after the Received header is prepended and before
///   DKIM signing, so header mutations are covered by the signature;
/// - `sender_delivered` after a successful RELEASE.
///
/// Errors surface with `category=plugin` and are classified as deferrable
/// unless the hook set an explicit action.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn sender_fetch(&self, delivery: &mut Delivery) -> Result<FetchDecision, DeliveryError> {
        let _ = delivery;
        Ok(FetchDecision::Deliver)
    }

    async fn sender_headers(
        &self,
        delivery: &Delivery,
        headers: &mut Headers,
    ) -> Result<(), DeliveryError> {
        let _ = (delivery, headers);
        Ok(())
    }

    async fn sender_delivered(&self, delivery: &Delivery, response: &str) {
        let _ = (delivery, response);
    }
}

/// Default hook set: every delivery goes out untouched.
pub struct NoopHooks;

#[async_trait]
impl PluginHooks for NoopHooks {}
