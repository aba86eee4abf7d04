use core::fmt;

use log::warn;

use crate::{
    headers::SubscriptionStateHeader,
    message::{header_value, Body, Request},
    Result,
};

/// Sends the final response for one inbound NOTIFY.
pub trait NotifyResponder: fmt::Debug {
    fn respond(&mut self, status_code: u16, reason: &str) -> Result<()>;
}

/// A NOTIFY received by the request core, not yet answered.
#[derive(Debug)]
pub struct IncomingNotify {
    request: Request,
    responder: Box<dyn NotifyResponder>,
}

impl IncomingNotify {
    pub fn new(request: Request, responder: Box<dyn NotifyResponder>) -> Self {
        Self { request, responder }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Parsed `Subscription-State`; a malformed value is logged and ignored.
    pub fn subscription_state(&self) -> Option<SubscriptionStateHeader> {
        let raw = header_value(&self.request.headers, "Subscription-State")?;
        match SubscriptionStateHeader::parse(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("unparseable Subscription-State {raw:?}: {e}");
                None
            }
        }
    }

    pub fn accept(mut self) -> Result<()> {
        self.responder.respond(200, "OK")
    }

    pub fn reject(mut self, status_code: u16, reason: &str) -> Result<()> {
        self.responder.respond(status_code, reason)
    }
}

/// Application-facing view of one NOTIFY.
#[derive(Debug)]
pub struct Notification {
    incoming: IncomingNotify,
}

impl Notification {
    pub fn new(incoming: IncomingNotify) -> Self {
        Self { incoming }
    }

    pub fn request(&self) -> &Request {
        self.incoming.request()
    }

    pub fn body(&self) -> Option<&Body> {
        self.incoming.request().body.as_ref()
    }

    pub fn accept(self) -> Result<()> {
        self.incoming.accept()
    }

    pub fn reject(self, status_code: u16, reason: &str) -> Result<()> {
        self.incoming.reject(status_code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        headers::SubState,
        message::{Header, Method},
        testing::RecordingResponder,
    };

    fn notify(state: &str) -> Request {
        let mut req = Request::new(Method::Notify, "sip:bob@192.0.2.4").unwrap();
        req.add_header(Header::new("Subscription-State", state).unwrap())
            .unwrap();
        req.set_body(Body::new("application/pidf+xml", b"<presence/>").unwrap());
        req
    }

    #[test]
    fn exposes_state_and_body() {
        let (responder, _log) = RecordingResponder::new();
        let incoming = IncomingNotify::new(notify("pending"), Box::new(responder));
        assert_eq!(incoming.subscription_state().unwrap().state, SubState::Pending);

        let notification = Notification::new(incoming);
        assert_eq!(notification.body().unwrap().as_bytes(), b"<presence/>");
    }

    #[test]
    fn accept_and_reject_send_responses() {
        let (responder, log) = RecordingResponder::new();
        IncomingNotify::new(notify("active"), Box::new(responder))
            .accept()
            .unwrap();
        let (responder, _) = RecordingResponder::with_log(log.clone());
        Notification::new(IncomingNotify::new(notify("active"), Box::new(responder)))
            .reject(489, "Bad Event")
            .unwrap();
        assert_eq!(*log.borrow(), vec![200, 489]);
    }
}
