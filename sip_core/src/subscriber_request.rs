use log::{debug, info, warn};

use crate::{
    config::UserAgentConfig,
    dialog::{SubscriptionDialog, SubscriptionDialogState},
    message::{Body, Header, Method, Request, Response},
    notification::IncomingNotify,
    request_core::{RequestCore, RequestId, RequestParams, SubscribeCallback},
    Result, SipError,
};

/// How one SUBSCRIBE attempt ended.
#[derive(Debug)]
pub enum SubscribeResult {
    /// The first NOTIFY arrived. It is authoritative whether or not the
    /// final response has been seen yet.
    Success {
        dialog: Option<Box<dyn SubscriptionDialog>>,
        request: IncomingNotify,
    },
    /// Non-2xx final response, or Timer N without a NOTIFY (`response` is
    /// `None`).
    Failure { response: Option<Response> },
}

#[derive(Debug)]
pub enum CoordinatorEvent {
    /// 2xx to the SUBSCRIBE. Informational only.
    Accepted(Response),
    Resolved(SubscribeResult),
}

/// Owns exactly one outgoing SUBSCRIBE and resolves the race between its
/// final response and the first NOTIFY. Single use.
#[derive(Debug)]
pub struct SubscriberRequest {
    message: Request,
    subscribed: bool,
    request_id: Option<RequestId>,
    resolved: bool,
    established: bool,
}

impl SubscriberRequest {
    pub fn new(
        core: &mut dyn RequestCore,
        config: &UserAgentConfig,
        target: &str,
        event: &str,
        expires: u32,
        extra_headers: &[Header],
        body: Option<&Body>,
    ) -> Result<Self> {
        let mut headers = extra_headers.to_vec();
        headers.push(Header::new("Event", event)?);
        headers.push(Header::new("Expires", &expires.to_string())?);
        headers.push(Header::new("Contact", &config.contact)?);
        headers.push(Header::new("Allow", &config.allow_header_value())?);

        let message = core.make_outgoing_request(
            Method::Subscribe,
            target,
            &config.aor,
            target,
            &RequestParams::default(),
            &headers,
            body,
        )?;

        Ok(Self {
            message,
            subscribed: false,
            request_id: None,
            resolved: false,
            established: false,
        })
    }

    pub fn message(&self) -> &Request {
        &self.message
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// True once a NOTIFY established a dialog for this attempt.
    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Derived state. Once a dialog exists this mirrors `dialog_state`.
    pub fn state(&self, dialog_state: Option<SubscriptionDialogState>) -> SubscriptionDialogState {
        if self.established {
            dialog_state.unwrap_or(SubscriptionDialogState::Terminated)
        } else if self.subscribed {
            SubscriptionDialogState::NotifyWait
        } else {
            SubscriptionDialogState::Initial
        }
    }

    pub fn subscribe(&mut self, core: &mut dyn RequestCore) -> Result<RequestId> {
        if self.subscribed {
            return Err(SipError::InvalidState(
                "SUBSCRIBE already sent; request coordinators are single use",
            ));
        }
        self.subscribed = true;
        let id = core.subscribe(self.message.clone())?;
        debug!("SUBSCRIBE {} sent as {id}", self.message.uri);
        self.request_id = Some(id);
        Ok(id)
    }

    /// Feed one callback for this request. Returns the resolution the first
    /// time a deciding callback arrives; later ones are no-ops.
    pub fn on_callback(&mut self, callback: SubscribeCallback) -> Option<CoordinatorEvent> {
        if self.resolved {
            match callback {
                SubscribeCallback::Accept(response) => {
                    return Some(CoordinatorEvent::Accepted(response));
                }
                SubscribeCallback::Notify(result) => {
                    // A forked NOTIFY after the race was decided; answer it
                    // and leave the extra dialog to the dialog layer.
                    debug!("late NOTIFY on a resolved SUBSCRIBE");
                    if let Err(e) = result.request.accept() {
                        warn!("failed to accept late NOTIFY: {e}");
                    }
                }
                other => debug!("ignoring {other:?} on a resolved SUBSCRIBE"),
            }
            return None;
        }

        let result = match callback {
            SubscribeCallback::Accept(response) => {
                return Some(CoordinatorEvent::Accepted(response));
            }
            SubscribeCallback::Notify(result) => {
                let mut dialog = result.dialog;
                if let Some(dialog) = dialog.as_mut() {
                    dialog.set_auto_refresh(true);
                    self.established = true;
                }
                SubscribeResult::Success {
                    dialog,
                    request: result.request,
                }
            }
            SubscribeCallback::NotifyTimeout => {
                info!("no NOTIFY before Timer N for {}", self.message.uri);
                SubscribeResult::Failure { response: None }
            }
            SubscribeCallback::Redirect(response) | SubscribeCallback::Reject(response) => {
                info!(
                    "SUBSCRIBE to {} failed with {}",
                    self.message.uri, response.status_code
                );
                SubscribeResult::Failure {
                    response: Some(response),
                }
            }
        };
        self.resolved = true;
        Some(CoordinatorEvent::Resolved(result))
    }

    /// Stop the Timer N wait and release the request.
    pub fn dispose(&mut self, core: &mut dyn RequestCore) {
        if let Some(id) = self.request_id.take() {
            core.wait_notify_stop(id);
            core.dispose_request(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dialog::SubscriptionDialogState as DS,
        message::header_value,
        request_core::NotifyResult,
        testing::{notify, response, MockCore, MockDialog},
    };

    fn coordinator(core: &mut MockCore) -> SubscriberRequest {
        let config = UserAgentConfig::new("sip:alice@example.com", "sip:alice@192.0.2.1");
        SubscriberRequest::new(core, &config, "sip:bob@example.com", "presence", 600, &[], None)
            .unwrap()
    }

    #[test]
    fn builds_subscribe_headers() {
        let mut core = MockCore::new();
        let req = coordinator(&mut core);
        let msg = req.message();
        assert_eq!(msg.method, Method::Subscribe);
        assert_eq!(header_value(&msg.headers, "Event"), Some("presence"));
        assert_eq!(header_value(&msg.headers, "Expires"), Some("600"));
        assert_eq!(header_value(&msg.headers, "Contact"), Some("sip:alice@192.0.2.1"));
        assert_eq!(header_value(&msg.headers, "Allow"), Some("NOTIFY,OPTIONS"));
    }

    #[test]
    fn second_subscribe_is_rejected() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        req.subscribe(&mut core).unwrap();
        assert!(matches!(
            req.subscribe(&mut core),
            Err(SipError::InvalidState(_))
        ));
        assert_eq!(core.sent_subscribes().len(), 1);
    }

    #[test]
    fn derived_state_follows_lifecycle() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        assert_eq!(req.state(None), DS::Initial);
        req.subscribe(&mut core).unwrap();
        assert_eq!(req.state(None), DS::NotifyWait);

        let (dialog, _handle) = MockDialog::new(DS::Active);
        let event = req.on_callback(SubscribeCallback::Notify(NotifyResult {
            dialog: Some(Box::new(dialog)),
            request: notify("active"),
        }));
        let Some(CoordinatorEvent::Resolved(SubscribeResult::Success { dialog, .. })) = event else {
            panic!("expected success");
        };
        let dialog = dialog.unwrap();
        assert!(dialog.auto_refresh());
        assert_eq!(req.state(Some(dialog.state())), DS::Active);
    }

    #[test]
    fn accept_does_not_resolve_race() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        req.subscribe(&mut core).unwrap();
        let event = req.on_callback(SubscribeCallback::Accept(response(202)));
        assert!(matches!(event, Some(CoordinatorEvent::Accepted(_))));
        assert!(!req.is_resolved());
    }

    #[test]
    fn notify_before_final_response_wins() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        req.subscribe(&mut core).unwrap();
        let (dialog, _handle) = MockDialog::new(DS::Pending);
        let first = req.on_callback(SubscribeCallback::Notify(NotifyResult {
            dialog: Some(Box::new(dialog)),
            request: notify("pending"),
        }));
        assert!(matches!(
            first,
            Some(CoordinatorEvent::Resolved(SubscribeResult::Success { .. }))
        ));
        // final response after the NOTIFY is informational
        let late = req.on_callback(SubscribeCallback::Accept(response(200)));
        assert!(matches!(late, Some(CoordinatorEvent::Accepted(_))));
        // a reject after resolution changes nothing
        assert!(req
            .on_callback(SubscribeCallback::Reject(response(481)))
            .is_none());
    }

    #[test]
    fn timeout_and_reject_resolve_failure_once() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        req.subscribe(&mut core).unwrap();
        let event = req.on_callback(SubscribeCallback::NotifyTimeout);
        assert!(matches!(
            event,
            Some(CoordinatorEvent::Resolved(SubscribeResult::Failure { response: None }))
        ));
        assert!(req
            .on_callback(SubscribeCallback::Reject(response(403)))
            .is_none());

        let mut req = coordinator(&mut core);
        req.subscribe(&mut core).unwrap();
        let event = req.on_callback(SubscribeCallback::Redirect(response(302)));
        match event {
            Some(CoordinatorEvent::Resolved(SubscribeResult::Failure { response: Some(r) })) => {
                assert_eq!(r.status_code, 302)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dispose_stops_timer_n_and_releases() {
        let mut core = MockCore::new();
        let mut req = coordinator(&mut core);
        let id = req.subscribe(&mut core).unwrap();
        req.dispose(&mut core);
        assert_eq!(core.notify_waits_stopped(), vec![id]);
        assert_eq!(core.disposed_requests(), vec![id]);
        // second dispose is a no-op
        req.dispose(&mut core);
        assert_eq!(core.disposed_requests(), vec![id]);
    }
}
