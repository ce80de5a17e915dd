use crate::render::RenderedNotification;
use async_trait::async_trait;
use concepts::{Container, Subscriber};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Sink for rendered digests, e.g. chat messages or webhooks.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        container: &Container,
        subscriber: &Subscriber,
        notification: &RenderedNotification,
    ) -> Result<(), DeliveryError>;
}

#[cfg(test)]
pub mod recording {
    use super::{Delivery, DeliveryError};
    use crate::render::RenderedNotification;
    use async_trait::async_trait;
    use concepts::{Container, Subscriber, UserId};
    use hashbrown::HashSet;
    use std::sync::{Arc, Mutex};

    /// Remembers every delivery, failing for the configured subscribers.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDelivery {
        delivered: Arc<Mutex<Vec<(UserId, RenderedNotification)>>>,
        failing: Arc<Mutex<HashSet<UserId>>>,
    }

    impl RecordingDelivery {
        pub fn fail_for(&self, subscriber_id: UserId) {
            self.failing.lock().unwrap().insert(subscriber_id);
        }

        #[must_use]
        pub fn delivered(&self) -> Vec<(UserId, RenderedNotification)> {
            self.delivered.lock().unwrap().clone()
        }

        #[must_use]
        pub fn recipients(&self) -> Vec<UserId> {
            self.delivered()
                .into_iter()
                .map(|(subscriber_id, _)| subscriber_id)
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(
            &self,
            _container: &Container,
            subscriber: &Subscriber,
            notification: &RenderedNotification,
        ) -> Result<(), DeliveryError> {
            if self.failing.lock().unwrap().contains(&subscriber.subscriber_id) {
                return Err(DeliveryError::Rejected(format!(
                    "subscriber `{}` is unreachable",
                    subscriber.subscriber_id
                )));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((subscriber.subscriber_id.clone(), notification.clone()));
            Ok(())
        }
    }
}
