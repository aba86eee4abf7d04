use core::fmt;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    config::{SubscriptionOptions, UserAgentConfig},
    dialog::{SipDialogId, SubscriptionDialog, SubscriptionDialogState},
    headers::{tag_param, SubState, TerminationReason},
    message::{header_value, Body, Header, Response},
    notification::{IncomingNotify, Notification},
    request_core::{DialogCallback, InDialogCallback, RequestCore, RequestId, SubscribeCallback},
    subscriber_request::{CoordinatorEvent, SubscribeResult, SubscriberRequest},
    timer::Timer,
    Disposal, Result, SipError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    #[default]
    Initial,
    NotifyWait,
    Subscribed,
    Terminated,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Initial => "Initial",
            SubscriptionState::NotifyWait => "NotifyWait",
            SubscriptionState::Subscribed => "Subscribed",
            SubscriptionState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call-ID, From tag and event package of the first SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(call_id: &str, local_tag: &str, event: &str) -> Self {
        Self(format!("{call_id}{local_tag}{event}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    StateChanged(SubscriptionState),
    Disposed,
}

pub trait SubscriptionDelegate {
    /// The notification must be accepted or rejected by the delegate.
    fn on_notify(&mut self, notification: Notification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InDialogRequest {
    Refresh,
    AutoRefresh,
    Unsubscribe,
}

/// Subscriber side of one event subscription (RFC 6665).
///
/// All methods are sans-IO: requests go out through the [`RequestCore`]
/// passed in, and everything the network or a timer produces comes back in
/// through the `on_*` methods and [`Subscription::poll`].
pub struct Subscription {
    id: SubscriptionId,
    target: String,
    event: String,
    expires: u32,
    extra_headers: Vec<Header>,
    body: Option<Body>,
    config: UserAgentConfig,

    state: SubscriptionState,
    disposed: bool,
    disposal_pending: bool,

    request: Option<SubscriberRequest>,
    dialog: Option<Box<dyn SubscriptionDialog>>,
    in_dialog: HashMap<RequestId, InDialogRequest>,
    retry_timer: Timer,

    delegate: Option<Box<dyn SubscriptionDelegate>>,
    events: Vec<SubscriptionEvent>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("event", &self.event)
            .field("state", &self.state)
            .field("disposed", &self.disposed)
            .field("dialog", &self.dialog.as_ref().map(|d| d.id()))
            .field("retry_at", &self.retry_timer.deadline())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(
        core: &mut dyn RequestCore,
        config: &UserAgentConfig,
        target: &str,
        event: &str,
        options: SubscriptionOptions,
    ) -> Result<Self> {
        let request = SubscriberRequest::new(
            core,
            config,
            target,
            event,
            options.expires,
            &options.extra_headers,
            options.body.as_ref(),
        )?;

        let message = request.message();
        let call_id = header_value(&message.headers, "Call-ID")
            .ok_or(SipError::Invalid("SUBSCRIBE without Call-ID"))?;
        let from_tag = header_value(&message.headers, "From")
            .and_then(tag_param)
            .ok_or(SipError::Invalid("SUBSCRIBE without From tag"))?;
        let id = SubscriptionId::new(call_id, from_tag, event);

        Ok(Self {
            id,
            target: target.to_string(),
            event: event.to_string(),
            expires: options.expires,
            extra_headers: options.extra_headers,
            body: options.body,
            config: config.clone(),
            state: SubscriptionState::Initial,
            disposed: false,
            disposal_pending: false,
            request: Some(request),
            dialog: None,
            in_dialog: HashMap::new(),
            retry_timer: Timer::new(),
            delegate: None,
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Disposed, and not waiting on the dialog to finish unsubscribing.
    pub fn is_finished(&self) -> bool {
        self.disposed && !self.disposal_pending
    }

    pub fn dialog_id(&self) -> Option<&SipDialogId> {
        self.dialog.as_ref().map(|d| d.id())
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn SubscriptionDelegate>>) {
        self.delegate = delegate;
    }

    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether `id` is the current SUBSCRIBE or an in-dialog request of ours.
    pub fn owns_request(&self, id: RequestId) -> bool {
        self.current_request_id() == Some(id) || self.in_dialog.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_timer.deadline()
    }

    fn current_request_id(&self) -> Option<RequestId> {
        self.request.as_ref().and_then(SubscriberRequest::request_id)
    }

    fn coordinator_state(&self) -> Option<SubscriptionDialogState> {
        let dialog_state = self.dialog.as_ref().map(|d| d.state());
        self.request.as_ref().map(|r| r.state(dialog_state))
    }

    pub fn subscribe(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        if self.disposed {
            return Err(SipError::InvalidState("subscription disposed"));
        }
        let coordinator_state = self
            .coordinator_state()
            .ok_or(SipError::InvalidState("no SUBSCRIBE request"))?;

        match coordinator_state {
            SubscriptionDialogState::Initial => {
                // Retries re-enter here with the public state already past Initial.
                if self.state == SubscriptionState::Initial {
                    self.transition(core, SubscriptionState::NotifyWait)?;
                }
                self.retry_timer.cancel();
                if let Some(request) = self.request.as_mut() {
                    request.subscribe(core)?;
                }
            }
            SubscriptionDialogState::NotifyWait | SubscriptionDialogState::Pending => {
                debug!("subscription {} already in progress", self.id);
            }
            SubscriptionDialogState::Active => {
                if let Some(dialog) = self.dialog.as_mut() {
                    let id = dialog.refresh()?;
                    debug!("subscription {} refreshing as {id}", self.id);
                    self.in_dialog.insert(id, InDialogRequest::Refresh);
                }
            }
            SubscriptionDialogState::Terminated => {
                debug!("subscription {} dialog already terminated", self.id);
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        if let Some(dialog) = self.dialog.as_mut() {
            if dialog.state().is_live() {
                // The response is not interesting; the dialog reports its
                // own termination.
                match dialog.unsubscribe() {
                    Ok(id) => {
                        self.in_dialog.insert(id, InDialogRequest::Unsubscribe);
                    }
                    Err(e) => warn!("un-SUBSCRIBE for {} failed to send: {e}", self.id),
                }
            }
        }
        self.transition(core, SubscriptionState::Terminated)
    }

    pub fn dispose(&mut self, core: &mut dyn RequestCore) -> Result<Disposal> {
        if self.disposed {
            return Ok(if self.disposal_pending {
                Disposal::Pending
            } else {
                Disposal::Complete
            });
        }
        self.disposed = true;
        debug!("subscription {} in state {} is being disposed", self.id, self.state);

        self.retry_timer.cancel();
        if let Some(mut request) = self.request.take() {
            request.dispose(core);
        }

        if self.state != SubscriptionState::Subscribed {
            self.events.push(SubscriptionEvent::Disposed);
            return Ok(Disposal::Complete);
        }

        let dialog = self
            .dialog
            .as_mut()
            .ok_or(SipError::InvalidState("subscribed without a dialog"))?;
        if dialog.state().is_live() {
            match dialog.unsubscribe() {
                Ok(id) => {
                    self.in_dialog.insert(id, InDialogRequest::Unsubscribe);
                    self.disposal_pending = true;
                    return Ok(Disposal::Pending);
                }
                Err(e) => warn!("un-SUBSCRIBE for {} failed to send: {e}", self.id),
            }
        }
        self.events.push(SubscriptionEvent::Disposed);
        Ok(Disposal::Complete)
    }

    /// Callback for the current SUBSCRIBE attempt.
    pub fn on_subscribe_callback(
        &mut self,
        core: &mut dyn RequestCore,
        now: Instant,
        id: RequestId,
        callback: SubscribeCallback,
    ) -> Result<()> {
        let Some(request) = self
            .request
            .as_mut()
            .filter(|r| r.request_id() == Some(id))
        else {
            debug!("subscription {}: dropping callback for stale {id}", self.id);
            if let SubscribeCallback::Notify(result) = callback {
                accept_or_warn(result.request);
            }
            return Ok(());
        };

        match request.on_callback(callback) {
            None => Ok(()),
            Some(CoordinatorEvent::Accepted(response)) => {
                self.on_accepted(&response);
                Ok(())
            }
            Some(CoordinatorEvent::Resolved(SubscribeResult::Success { dialog, request })) => {
                if let Some(dialog) = dialog {
                    info!("subscription {} established dialog {}", self.id, dialog.id());
                    self.dialog = Some(dialog);
                }
                self.on_notify(core, now, request)
            }
            Some(CoordinatorEvent::Resolved(SubscribeResult::Failure { response })) => {
                info!(
                    "subscription {} attempt failed ({})",
                    self.id,
                    response
                        .map(|r| r.status_code.to_string())
                        .unwrap_or_else(|| "timeout".to_string())
                );
                self.unsubscribe(core)
            }
        }
    }

    /// Event raised by the dialog this subscription holds.
    pub fn on_dialog_callback(
        &mut self,
        core: &mut dyn RequestCore,
        now: Instant,
        callback: DialogCallback,
    ) -> Result<()> {
        match callback {
            DialogCallback::Notify(request) => self.on_notify(core, now, request),
            DialogCallback::Refresh(id) => {
                debug!("subscription {} dialog auto-refresh {id}", self.id);
                self.in_dialog.insert(id, InDialogRequest::AutoRefresh);
                Ok(())
            }
            DialogCallback::Terminated => self.on_dialog_terminated(core),
        }
    }

    /// Final response to a refresh or un-SUBSCRIBE sent in the dialog.
    pub fn on_in_dialog_callback(
        &mut self,
        core: &mut dyn RequestCore,
        id: RequestId,
        callback: InDialogCallback,
    ) -> Result<()> {
        let Some(kind) = self.in_dialog.remove(&id) else {
            debug!("subscription {}: no in-dialog request {id}", self.id);
            return Ok(());
        };
        match (kind, callback) {
            (InDialogRequest::Unsubscribe, callback) => {
                debug!("subscription {}: un-SUBSCRIBE answered {callback:?}", self.id);
                Ok(())
            }
            (_, InDialogCallback::Accept(response)) => {
                self.on_accepted(&response);
                Ok(())
            }
            (InDialogRequest::Refresh, InDialogCallback::Redirect(response))
            | (InDialogRequest::Refresh, InDialogCallback::Reject(response)) => {
                info!(
                    "subscription {} refresh failed with {}",
                    self.id, response.status_code
                );
                self.unsubscribe(core)
            }
            (InDialogRequest::AutoRefresh, callback) => {
                debug!("subscription {}: auto-refresh answered {callback:?}", self.id);
                Ok(())
            }
        }
    }

    /// Fire the retry-after timer if it is due.
    pub fn poll(&mut self, core: &mut dyn RequestCore, now: Instant) -> Result<()> {
        if self.retry_timer.fire(now) && !self.disposed {
            debug!("subscription {} retry-after elapsed", self.id);
            return self.subscribe(core);
        }
        Ok(())
    }

    fn on_accepted(&self, response: &Response) {
        debug!(
            "subscription {} accepted with {}",
            self.id, response.status_code
        );
    }

    fn on_notify(
        &mut self,
        core: &mut dyn RequestCore,
        now: Instant,
        request: IncomingNotify,
    ) -> Result<()> {
        if self.disposed {
            accept_or_warn(request);
            return Ok(());
        }
        if self.state != SubscriptionState::Subscribed {
            self.transition(core, SubscriptionState::Subscribed)?;
        }

        let subscription_state = request.subscription_state();
        match self.delegate.as_mut() {
            Some(delegate) => delegate.on_notify(Notification::new(request)),
            None => accept_or_warn(request),
        }

        let Some(subscription_state) = subscription_state else {
            return Ok(());
        };
        if subscription_state.state != SubState::Terminated {
            return Ok(());
        }

        if let Some(reason) = &subscription_state.reason {
            info!(
                "subscription {} terminated by notifier: {}",
                self.id,
                reason.as_str()
            );
            match reason {
                TerminationReason::Deactivated | TerminationReason::Timeout => {
                    self.renew_request(core)?;
                    return self.subscribe(core);
                }
                TerminationReason::Probation | TerminationReason::Giveup => {
                    self.renew_request(core)?;
                    match subscription_state.retry_after {
                        Some(secs) => {
                            debug!("subscription {} retrying in {secs}s", self.id);
                            self.retry_timer
                                .arm(now, Duration::from_secs(u64::from(secs)));
                            return Ok(());
                        }
                        None => return self.subscribe(core),
                    }
                }
                _ => {}
            }
        }
        self.unsubscribe(core)
    }

    fn on_dialog_terminated(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        if self.disposal_pending {
            self.disposal_pending = false;
            debug!("subscription {} dialog terminated; disposal complete", self.id);
            self.in_dialog.clear();
            self.events.push(SubscriptionEvent::Disposed);
            return Ok(());
        }
        if self.disposed {
            return Ok(());
        }
        let re_subscribing = self
            .request
            .as_ref()
            .map_or(false, |r| !r.is_established());
        if re_subscribing {
            // The dialog we hold belongs to an earlier attempt.
            debug!("subscription {}: previous dialog terminated", self.id);
            return Ok(());
        }
        if self.state != SubscriptionState::Terminated {
            self.transition(core, SubscriptionState::Terminated)?;
        }
        Ok(())
    }

    /// Replace the request coordinator with a fresh, unsent one.
    fn renew_request(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        let request = SubscriberRequest::new(
            core,
            &self.config,
            &self.target,
            &self.event,
            self.expires,
            &self.extra_headers,
            self.body.as_ref(),
        )?;
        if let Some(mut old) = self.request.replace(request) {
            old.dispose(core);
        }
        // Answers still owed by the superseded dialog only ever get logged.
        self.in_dialog.clear();
        Ok(())
    }

    fn transition(&mut self, core: &mut dyn RequestCore, to: SubscriptionState) -> Result<()> {
        use SubscriptionState::*;

        let legal = matches!(
            (self.state, to),
            (Initial, NotifyWait)
                | (Initial, Terminated)
                | (NotifyWait, Subscribed)
                | (NotifyWait, Terminated)
                | (Subscribed, Terminated)
        );
        if !legal {
            return Err(SipError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }

        self.state = to;
        info!("subscription {} transitioned to {to}", self.id);
        self.events.push(SubscriptionEvent::StateChanged(to));

        if to == Terminated {
            self.dispose(core)?;
        }
        Ok(())
    }
}

fn accept_or_warn(request: IncomingNotify) {
    if let Err(e) = request.accept() {
        warn!("failed to accept NOTIFY: {e}");
    }
}
