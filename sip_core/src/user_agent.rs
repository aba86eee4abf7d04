use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, warn};

use crate::{
    config::{PublicationOptions, SubscriptionOptions, UserAgentConfig},
    dialog::SipDialogId,
    publication::{Publication, PublicationEvent, PublicationId},
    request_core::{DialogCallback, InDialogCallback, PublishCallback, RequestCore, RequestId, SubscribeCallback},
    subscription::{Subscription, SubscriptionDelegate, SubscriptionEvent, SubscriptionId},
    timer::earliest,
    Disposal, Result, SipError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentEvent {
    Subscription {
        id: SubscriptionId,
        event: SubscriptionEvent,
    },
    Publication {
        id: PublicationId,
        event: PublicationEvent,
    },
}

/// Registry of the subscriptions and publications of one user agent.
///
/// Routes callbacks from the request core to the engine that owns them and
/// drops engines once their disposal has completed.
#[derive(Debug)]
pub struct UserAgent<C: RequestCore> {
    core: C,
    config: UserAgentConfig,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    publications: BTreeMap<PublicationId, Publication>,
    events: Vec<UserAgentEvent>,
}

impl<C: RequestCore> UserAgent<C> {
    pub fn new(core: C, config: UserAgentConfig) -> Self {
        Self {
            core,
            config,
            subscriptions: BTreeMap::new(),
            publications: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &UserAgentConfig {
        &self.config
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut C {
        &mut self.core
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn publication(&self, id: &PublicationId) -> Option<&Publication> {
        self.publications.get(id)
    }

    pub fn subscription_ids(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.subscriptions.keys()
    }

    pub fn publication_ids(&self) -> impl Iterator<Item = &PublicationId> {
        self.publications.keys()
    }

    pub fn create_subscription(
        &mut self,
        target: &str,
        event: &str,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionId> {
        let subscription = Subscription::new(&mut self.core, &self.config, target, event, options)?;
        let id = subscription.id().clone();
        if self.subscriptions.contains_key(&id) {
            return Err(SipError::Duplicate(id.to_string()));
        }
        debug!("registered subscription {id}");
        self.subscriptions.insert(id.clone(), subscription);
        Ok(id)
    }

    pub fn create_publication(
        &mut self,
        target: &str,
        event: &str,
        options: PublicationOptions,
    ) -> Result<PublicationId> {
        let publication = Publication::new(&self.config, target, event, options);
        let id = publication.id().clone();
        if self.publications.contains_key(&id) {
            return Err(SipError::Duplicate(id.to_string()));
        }
        debug!("registered publication {id}");
        self.publications.insert(id.clone(), publication);
        Ok(id)
    }

    pub fn set_subscription_delegate(
        &mut self,
        id: &SubscriptionId,
        delegate: Option<Box<dyn SubscriptionDelegate>>,
    ) -> Result<()> {
        self.subscription_mut(id)?.set_delegate(delegate);
        Ok(())
    }

    pub fn subscribe(&mut self, id: &SubscriptionId) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = subscription.subscribe(&mut self.core);
        self.sweep();
        result
    }

    pub fn unsubscribe(&mut self, id: &SubscriptionId) -> Result<()> {
        let subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = subscription.unsubscribe(&mut self.core);
        self.sweep();
        result
    }

    pub fn dispose_subscription(&mut self, id: &SubscriptionId) -> Result<Disposal> {
        let subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = subscription.dispose(&mut self.core);
        self.sweep();
        result
    }

    pub fn publish(&mut self, id: &PublicationId, content: &[u8]) -> Result<()> {
        let publication = self
            .publications
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = publication.publish(&mut self.core, content);
        self.sweep();
        result
    }

    pub fn unpublish(&mut self, id: &PublicationId) -> Result<()> {
        let publication = self
            .publications
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = publication.unpublish(&mut self.core);
        self.sweep();
        result
    }

    pub fn dispose_publication(&mut self, id: &PublicationId) -> Result<Disposal> {
        let publication = self
            .publications
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))?;
        let result = publication.dispose(&mut self.core);
        self.sweep();
        result
    }

    pub fn on_subscribe_callback(
        &mut self,
        now: Instant,
        request: RequestId,
        callback: SubscribeCallback,
    ) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .values_mut()
            .find(|s| s.owns_request(request))
        else {
            debug!("no subscription owns {request}; dropping {callback:?}");
            if let SubscribeCallback::Notify(result) = callback {
                if let Err(e) = result.request.accept() {
                    warn!("failed to accept unmatched NOTIFY: {e}");
                }
            }
            return Ok(());
        };
        let result = subscription.on_subscribe_callback(&mut self.core, now, request, callback);
        self.sweep();
        result
    }

    pub fn on_in_dialog_callback(
        &mut self,
        request: RequestId,
        callback: InDialogCallback,
    ) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .values_mut()
            .find(|s| s.owns_request(request))
        else {
            debug!("no subscription owns {request}; dropping {callback:?}");
            return Ok(());
        };
        let result = subscription.on_in_dialog_callback(&mut self.core, request, callback);
        self.sweep();
        result
    }

    pub fn on_dialog_callback(
        &mut self,
        now: Instant,
        dialog: &SipDialogId,
        callback: DialogCallback,
    ) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .values_mut()
            .find(|s| s.dialog_id() == Some(dialog))
        else {
            debug!("no subscription holds dialog {dialog}");
            if let DialogCallback::Notify(request) = callback {
                if let Err(e) = request.accept() {
                    warn!("failed to accept unmatched NOTIFY: {e}");
                }
            }
            return Ok(());
        };
        let result = subscription.on_dialog_callback(&mut self.core, now, callback);
        self.sweep();
        result
    }

    pub fn on_publish_callback(
        &mut self,
        now: Instant,
        request: RequestId,
        callback: PublishCallback,
    ) -> Result<()> {
        let Some(publication) = self
            .publications
            .values_mut()
            .find(|p| p.owns_request(request))
        else {
            debug!("no publication owns {request}; dropping {callback:?}");
            return Ok(());
        };
        let result = publication.on_publish_callback(&mut self.core, now, request, callback);
        self.sweep();
        result
    }

    /// Fire every due timer. The first error is returned after all engines
    /// have been polled.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        let mut result = Ok(());
        for subscription in self.subscriptions.values_mut() {
            let polled = subscription.poll(&mut self.core, now);
            if result.is_ok() {
                result = polled;
            }
        }
        for publication in self.publications.values_mut() {
            let polled = publication.poll(&mut self.core, now);
            if result.is_ok() {
                result = polled;
            }
        }
        self.sweep();
        result
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let subscriptions = self
            .subscriptions
            .values()
            .map(Subscription::next_deadline)
            .fold(None, earliest);
        self.publications
            .values()
            .map(Publication::next_deadline)
            .fold(subscriptions, earliest)
    }

    pub fn take_events(&mut self) -> Vec<UserAgentEvent> {
        std::mem::take(&mut self.events)
    }

    /// Dispose every engine. Engines with a pending disposal stay registered
    /// until their final callback arrives.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        for subscription in self.subscriptions.values_mut() {
            if let Err(e) = subscription.dispose(&mut self.core) {
                warn!("disposing subscription {} failed: {e}", subscription.id());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        for publication in self.publications.values_mut() {
            if let Err(e) = publication.dispose(&mut self.core) {
                warn!("disposing publication {} failed: {e}", publication.id());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.sweep();
        result
    }

    fn subscription_mut(&mut self, id: &SubscriptionId) -> Result<&mut Subscription> {
        self.subscriptions
            .get_mut(id)
            .ok_or_else(|| SipError::NotFound(id.to_string()))
    }

    /// Collect engine events and forget engines that are fully disposed.
    fn sweep(&mut self) {
        for (id, subscription) in self.subscriptions.iter_mut() {
            self.events
                .extend(subscription.take_events().into_iter().map(|event| {
                    UserAgentEvent::Subscription {
                        id: id.clone(),
                        event,
                    }
                }));
        }
        for (id, publication) in self.publications.iter_mut() {
            self.events
                .extend(publication.take_events().into_iter().map(|event| {
                    UserAgentEvent::Publication {
                        id: id.clone(),
                        event,
                    }
                }));
        }

        self.subscriptions.retain(|id, s| {
            let keep = !s.is_finished();
            if !keep {
                debug!("dropping subscription {id}");
            }
            keep
        });
        self.publications.retain(|id, p| {
            let keep = !p.is_finished();
            if !keep {
                debug!("dropping publication {id}");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dialog::SubscriptionDialogState as DS,
        publication::PublicationState,
        request_core::NotifyResult,
        subscription::SubscriptionState,
        testing::{notify, notify_logged, response, response_with, MockCore, MockDialog, ResponseLog},
    };

    fn user_agent() -> UserAgent<MockCore> {
        UserAgent::new(
            MockCore::new(),
            UserAgentConfig::new("sip:alice@example.com", "sip:alice@192.0.2.1"),
        )
    }

    #[test]
    fn routes_subscribe_callbacks_by_request() {
        let mut ua = user_agent();
        let first = ua
            .create_subscription("sip:bob@example.com", "presence", SubscriptionOptions::default())
            .unwrap();
        let second = ua
            .create_subscription("sip:carol@example.com", "presence", SubscriptionOptions::default())
            .unwrap();
        ua.subscribe(&first).unwrap();
        ua.subscribe(&second).unwrap();
        let second_request = ua.core().last_subscribe_id();
        ua.take_events();

        let (dialog, _) = MockDialog::new(DS::Active);
        ua.on_subscribe_callback(
            Instant::now(),
            second_request,
            SubscribeCallback::Notify(NotifyResult {
                dialog: Some(Box::new(dialog)),
                request: notify("active"),
            }),
        )
        .unwrap();

        assert_eq!(
            ua.subscription(&second).unwrap().state(),
            SubscriptionState::Subscribed
        );
        assert_eq!(
            ua.subscription(&first).unwrap().state(),
            SubscriptionState::NotifyWait
        );
        assert_eq!(
            ua.take_events(),
            vec![UserAgentEvent::Subscription {
                id: second,
                event: SubscriptionEvent::StateChanged(SubscriptionState::Subscribed),
            }]
        );
    }

    #[test]
    fn unmatched_notify_is_accepted() {
        let mut ua = user_agent();
        let log = ResponseLog::default();
        let (dialog, _) = MockDialog::new(DS::Active);
        ua.on_subscribe_callback(
            Instant::now(),
            RequestId(99),
            SubscribeCallback::Notify(NotifyResult {
                dialog: Some(Box::new(dialog)),
                request: notify_logged("active", &log),
            }),
        )
        .unwrap();
        ua.on_dialog_callback(
            Instant::now(),
            &SipDialogId::new("nope", "a", "b"),
            DialogCallback::Notify(notify_logged("active", &log)),
        )
        .unwrap();
        assert_eq!(*log.borrow(), vec![200, 200]);
    }

    #[test]
    fn finished_subscriptions_are_removed() {
        let mut ua = user_agent();
        let id = ua
            .create_subscription("sip:bob@example.com", "presence", SubscriptionOptions::default())
            .unwrap();
        ua.subscribe(&id).unwrap();
        let request = ua.core().last_subscribe_id();
        ua.on_subscribe_callback(Instant::now(), request, SubscribeCallback::Reject(response(403)))
            .unwrap();

        assert!(ua.subscription(&id).is_none());
        let events = ua.take_events();
        assert_eq!(
            events.last(),
            Some(&UserAgentEvent::Subscription {
                id: id.clone(),
                event: SubscriptionEvent::Disposed,
            })
        );
        assert!(matches!(ua.subscribe(&id), Err(SipError::NotFound(_))));
    }

    #[test]
    fn pending_disposal_keeps_routing_until_dialog_ends() {
        let mut ua = user_agent();
        let now = Instant::now();
        let id = ua
            .create_subscription("sip:bob@example.com", "presence", SubscriptionOptions::default())
            .unwrap();
        ua.subscribe(&id).unwrap();
        let request = ua.core().last_subscribe_id();
        let (dialog, handle) = MockDialog::new(DS::Active);
        ua.on_subscribe_callback(
            now,
            request,
            SubscribeCallback::Notify(NotifyResult {
                dialog: Some(Box::new(dialog)),
                request: notify("active"),
            }),
        )
        .unwrap();
        let dialog_id = ua.subscription(&id).unwrap().dialog_id().cloned().unwrap();

        assert_eq!(ua.dispose_subscription(&id).unwrap(), Disposal::Pending);
        assert!(ua.subscription(&id).is_some());
        assert_eq!(handle.borrow().unsubscribes.len(), 1);

        handle.borrow_mut().state = DS::Terminated;
        ua.on_dialog_callback(now, &dialog_id, DialogCallback::Terminated)
            .unwrap();
        assert!(ua.subscription(&id).is_none());
    }

    #[test]
    fn duplicate_publication_is_rejected() {
        let mut ua = user_agent();
        ua.create_publication("sip:alice@example.com", "presence", PublicationOptions::default())
            .unwrap();
        let err = ua
            .create_publication("sip:alice@example.com", "presence", PublicationOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            SipError::Duplicate("sip:alice@example.com:presence".to_string())
        );
    }

    #[test]
    fn publication_refresh_through_poll() {
        let mut ua = user_agent();
        let now = Instant::now();
        let id = ua
            .create_publication("sip:alice@example.com", "presence", PublicationOptions::default())
            .unwrap();
        ua.publish(&id, b"open").unwrap();
        let request = ua.core().last_publish_id();
        ua.on_publish_callback(
            now,
            request,
            PublishCallback::Accept(response_with(200, &[("SIP-ETag", "e1"), ("Expires", "100")])),
        )
        .unwrap();
        assert_eq!(
            ua.publication(&id).unwrap().state(),
            PublicationState::Published
        );

        let deadline = ua.next_deadline().unwrap();
        assert_eq!(deadline, now + std::time::Duration::from_secs(90));
        ua.poll(deadline).unwrap();
        assert_eq!(ua.core().sent_publishes().len(), 2);
    }

    #[test]
    fn shutdown_disposes_everything() {
        let mut ua = user_agent();
        let now = Instant::now();
        let sub = ua
            .create_subscription("sip:bob@example.com", "presence", SubscriptionOptions::default())
            .unwrap();
        ua.subscribe(&sub).unwrap();
        let publ = ua
            .create_publication("sip:alice@example.com", "presence", PublicationOptions::default())
            .unwrap();
        ua.publish(&publ, b"open").unwrap();
        let request = ua.core().last_publish_id();
        ua.on_publish_callback(
            now,
            request,
            PublishCallback::Accept(response_with(200, &[("SIP-ETag", "e1")])),
        )
        .unwrap();

        ua.shutdown().unwrap();
        assert!(ua.subscription(&sub).is_none());
        // waiting for the answer to the removal PUBLISH
        assert!(ua.publication(&publ).is_some());

        let removal = ua.core().last_publish_id();
        ua.on_publish_callback(
            now,
            removal,
            PublishCallback::Accept(response_with(200, &[("SIP-ETag", "e1"), ("Expires", "0")])),
        )
        .unwrap();
        assert!(ua.publication(&publ).is_none());
        assert_eq!(ua.next_deadline(), None);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut ua = user_agent();
        let id = PublicationId::new("sip:x@example.com", "presence");
        assert!(matches!(ua.publish(&id, b""), Err(SipError::NotFound(_))));
        assert!(matches!(
            ua.dispose_publication(&id),
            Err(SipError::NotFound(_))
        ));
    }
}
