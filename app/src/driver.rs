use std::time::{Duration, Instant};

use log::{info, warn};

use sip_core::{
    Notification, PublicationId, PublicationOptions, SubscriptionDelegate, SubscriptionId,
    SubscriptionOptions, UserAgent, UserAgentConfig, UserAgentEvent,
};

use crate::{
    loopback::{presence_document, LoopbackCore, PIDF},
    messages::{Delivery, DeliveryReceiver, DeliverySender},
    settings::Settings,
    AppError,
};

/// Logs every presence document and accepts it.
struct PresenceWatcher;

impl SubscriptionDelegate for PresenceWatcher {
    fn on_notify(&mut self, notification: Notification) {
        match notification.body() {
            Some(body) => info!(
                "presence update ({}): {}",
                body.content_type,
                String::from_utf8_lossy(body.as_bytes())
            ),
            None => info!("presence update without a document"),
        }
        if let Err(e) = notification.accept() {
            warn!("failed to accept NOTIFY: {e}");
        }
    }
}

/// Drives one user agent against the loopback core on a simulated clock.
pub struct Driver {
    settings: &'static Settings,
    ua: UserAgent<LoopbackCore>,
    inbox: DeliveryReceiver,
    now: Instant,
}

impl Driver {
    pub fn new(settings: &'static Settings, outbox: DeliverySender, inbox: DeliveryReceiver) -> Self {
        let core = LoopbackCore::new(outbox, settings.granted_expires, settings.min_expires);
        let config = UserAgentConfig::new(settings.aor, settings.contact);
        Self {
            settings,
            ua: UserAgent::new(core, config),
            inbox,
            now: Instant::now(),
        }
    }

    pub fn run(&mut self) -> Result<(), AppError> {
        let subscription = self.start_subscription()?;
        let publication = self.start_publication()?;

        // first publication refresh
        self.advance()?;

        self.ua.core_mut().terminate_dialogs("deactivated")?;
        self.pump()?;
        match self.ua.subscription(&subscription) {
            Some(s) => info!("subscription {} is {} after deactivation", s.id(), s.state()),
            None => warn!("subscription {subscription} is gone after deactivation"),
        }

        let closed = presence_document(self.settings.aor, self.settings.final_status);
        self.ua.publish(&publication, closed.as_bytes())?;
        self.pump()?;
        info!(
            "compositor now holds entity tag {:?}",
            self.ua.core().entity_tag()
        );

        self.ua.shutdown()?;
        self.pump()?;

        let remaining = self.ua.subscription_ids().count() + self.ua.publication_ids().count();
        if remaining != 0 {
            return Err(AppError::Incomplete(remaining));
        }
        info!("all subscriptions and publications disposed");
        Ok(())
    }

    fn start_subscription(&mut self) -> Result<SubscriptionId, AppError> {
        let options = SubscriptionOptions {
            expires: self.settings.subscription_expires,
            ..SubscriptionOptions::default()
        };
        let id = self
            .ua
            .create_subscription(self.settings.presentity, self.settings.event, options)?;
        self.ua
            .set_subscription_delegate(&id, Some(Box::new(PresenceWatcher)))?;
        self.ua.subscribe(&id)?;
        self.pump()?;
        Ok(id)
    }

    fn start_publication(&mut self) -> Result<PublicationId, AppError> {
        let options = PublicationOptions {
            expires: self.settings.publication_expires,
            content_type: PIDF.to_string(),
            ..PublicationOptions::default()
        };
        let id = self
            .ua
            .create_publication(self.settings.aor, self.settings.event, options)?;
        let open = presence_document(self.settings.aor, self.settings.initial_status);
        self.ua.publish(&id, open.as_bytes())?;
        self.pump()?;
        Ok(id)
    }

    /// Jump the clock to the next deadline and fire it.
    fn advance(&mut self) -> Result<(), AppError> {
        let Some(deadline) = self.ua.next_deadline() else {
            info!("no timer armed");
            return Ok(());
        };
        let elapsed: Duration = deadline.saturating_duration_since(self.now);
        info!("advancing clock by {}s", elapsed.as_secs());
        self.now = deadline;
        self.ua.poll(self.now)?;
        self.pump()
    }

    /// Hand every queued delivery to the user agent until the network is
    /// quiet.
    fn pump(&mut self) -> Result<(), AppError> {
        while let Ok(delivery) = self.inbox.try_recv() {
            match delivery {
                Delivery::Subscribe(id, callback) => {
                    self.ua.on_subscribe_callback(self.now, id, callback)?
                }
                Delivery::InDialog(id, callback) => self.ua.on_in_dialog_callback(id, callback)?,
                Delivery::Dialog(dialog, callback) => {
                    self.ua.on_dialog_callback(self.now, &dialog, callback)?
                }
                Delivery::Publish(id, callback) => {
                    self.ua.on_publish_callback(self.now, id, callback)?
                }
            }
            for event in self.ua.take_events() {
                log_event(&event);
            }
        }
        for event in self.ua.take_events() {
            log_event(&event);
        }
        Ok(())
    }
}

fn log_event(event: &UserAgentEvent) {
    match event {
        UserAgentEvent::Subscription { id, event } => info!("subscription {id}: {event:?}"),
        UserAgentEvent::Publication { id, event } => info!("publication {id}: {event:?}"),
    }
}
