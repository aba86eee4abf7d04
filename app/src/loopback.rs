//! In-process request core. Plays the notifier for SUBSCRIBE and the event
//! state compositor for PUBLISH, answering through the delivery channel.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, info, log_enabled, trace, warn, Level};

use sip_core::{
    headers::{parse_delta_seconds, tag_param},
    message::{header_value, parse_message, Message, SmallString, MAX_RENDER_LEN},
    Body, DialogCallback, Header, InDialogCallback, IncomingNotify, Method, NotifyResponder,
    NotifyResult, PublishCallback, Request, RequestCore, RequestId, RequestParams, Response,
    SipDialogId, SipError, SubscribeCallback, SubscriptionDialog, SubscriptionDialogState,
};

use crate::messages::{Delivery, DeliverySender};

pub const PIDF: &str = "application/pidf+xml";

fn random_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn deliver(outbox: &DeliverySender, delivery: Delivery) -> sip_core::Result<()> {
    outbox
        .send(delivery)
        .map_err(|e| SipError::Core(format!("delivery channel closed: {e}")))
}

fn build_response(code: u16, reason: &str, headers: &[(&str, &str)]) -> sip_core::Result<Response> {
    let mut resp = Response::new(code, reason)?;
    for (name, value) in headers {
        resp.add_header(Header::new(name, value)?)?;
    }
    Ok(resp)
}

/// Render `request` and read it back the way the far end would see it.
fn over_the_wire(request: &Request) -> sip_core::Result<Request> {
    let text: SmallString<MAX_RENDER_LEN> = request.render()?;
    trace!("wire:\n{text}");
    match parse_message(&text)? {
        Message::Request(request) => Ok(request),
        Message::Response(_) => Err(SipError::Invalid("expected a request")),
    }
}

/// Request ids shared by the core and the dialogs it hands out.
#[derive(Debug, Clone, Default)]
struct IdAllocator(Rc<Cell<u64>>);

impl IdAllocator {
    fn next(&self) -> RequestId {
        let id = self.0.get() + 1;
        self.0.set(id);
        RequestId(id)
    }
}

/// Current presence document, shared between the compositor and the
/// notifier side.
#[derive(Debug, Clone, Default)]
struct PresenceDocument(Rc<RefCell<Option<Body>>>);

impl PresenceDocument {
    fn get(&self) -> Option<Body> {
        self.0.borrow().clone()
    }

    fn set(&self, body: Option<Body>) {
        *self.0.borrow_mut() = body;
    }
}

fn build_notify(
    contact: &str,
    dialog: &SipDialogId,
    event: &str,
    state: &str,
    document: &PresenceDocument,
) -> sip_core::Result<IncomingNotify> {
    let mut req = Request::new(Method::Notify, contact)?;
    req.add_header(Header::new("Call-ID", &dialog.call_id)?)?;
    req.add_header(Header::new("Event", event)?)?;
    req.add_header(Header::new("Subscription-State", state)?)?;
    if let Some(body) = document.get() {
        req.set_body(body);
    }
    let responder = LoopbackResponder {
        dialog: dialog.clone(),
    };
    Ok(IncomingNotify::new(req, Box::new(responder)))
}

#[derive(Debug)]
struct LoopbackResponder {
    dialog: SipDialogId,
}

impl NotifyResponder for LoopbackResponder {
    fn respond(&mut self, status_code: u16, reason: &str) -> sip_core::Result<()> {
        debug!("NOTIFY on {} answered {status_code} {reason}", self.dialog);
        Ok(())
    }
}

/// Subscriber end of a dialog created by the loopback notifier.
#[derive(Debug)]
pub struct LoopbackDialog {
    id: SipDialogId,
    event: String,
    contact: String,
    expires: u32,
    state: Rc<Cell<SubscriptionDialogState>>,
    auto_refresh: bool,
    ids: IdAllocator,
    document: PresenceDocument,
    outbox: DeliverySender,
}

impl SubscriptionDialog for LoopbackDialog {
    fn id(&self) -> &SipDialogId {
        &self.id
    }

    fn state(&self) -> SubscriptionDialogState {
        self.state.get()
    }

    fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    fn set_auto_refresh(&mut self, enabled: bool) {
        self.auto_refresh = enabled;
    }

    fn refresh(&mut self) -> sip_core::Result<RequestId> {
        let id = self.ids.next();
        debug!("dialog {} refresh {id}", self.id);
        let ok = build_response(200, "OK", &[("Expires", &self.expires.to_string())])?;
        deliver(&self.outbox, Delivery::InDialog(id, InDialogCallback::Accept(ok)))?;
        let state = format!("active;expires={}", self.expires);
        let notify = build_notify(&self.contact, &self.id, &self.event, &state, &self.document)?;
        deliver(
            &self.outbox,
            Delivery::Dialog(self.id.clone(), DialogCallback::Notify(notify)),
        )?;
        Ok(id)
    }

    fn unsubscribe(&mut self) -> sip_core::Result<RequestId> {
        let id = self.ids.next();
        debug!("dialog {} un-SUBSCRIBE {id}", self.id);
        self.state.set(SubscriptionDialogState::Terminated);
        let ok = build_response(200, "OK", &[("Expires", "0")])?;
        deliver(&self.outbox, Delivery::InDialog(id, InDialogCallback::Accept(ok)))?;
        let notify = build_notify(&self.contact, &self.id, &self.event, "terminated", &self.document)?;
        deliver(
            &self.outbox,
            Delivery::Dialog(self.id.clone(), DialogCallback::Notify(notify)),
        )?;
        deliver(
            &self.outbox,
            Delivery::Dialog(self.id.clone(), DialogCallback::Terminated),
        )?;
        Ok(id)
    }
}

/// Notifier-side record of a dialog it created.
#[derive(Debug)]
struct NotifierDialog {
    id: SipDialogId,
    event: String,
    contact: String,
    state: Rc<Cell<SubscriptionDialogState>>,
}

#[derive(Debug)]
pub struct LoopbackCore {
    outbox: DeliverySender,
    ids: IdAllocator,
    cseq: u32,
    granted_expires: u32,
    min_expires: u32,
    dialogs: Vec<NotifierDialog>,
    etag: Option<String>,
    document: PresenceDocument,
}

impl LoopbackCore {
    pub fn new(outbox: DeliverySender, granted_expires: u32, min_expires: u32) -> Self {
        Self {
            outbox,
            ids: IdAllocator::default(),
            cseq: 0,
            granted_expires,
            min_expires,
            dialogs: Vec::new(),
            etag: None,
            document: PresenceDocument::default(),
        }
    }

    /// Entity tag of the publication the compositor currently holds.
    pub fn entity_tag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Notifier-initiated termination of every live dialog.
    pub fn terminate_dialogs(&mut self, reason: &str) -> sip_core::Result<()> {
        for dialog in &self.dialogs {
            if !dialog.state.get().is_live() {
                continue;
            }
            info!("notifier terminating dialog {} ({reason})", dialog.id);
            dialog.state.set(SubscriptionDialogState::Terminated);
            let state = format!("terminated;reason={reason}");
            let notify = build_notify(&dialog.contact, &dialog.id, &dialog.event, &state, &self.document)?;
            deliver(
                &self.outbox,
                Delivery::Dialog(dialog.id.clone(), DialogCallback::Notify(notify)),
            )?;
            deliver(
                &self.outbox,
                Delivery::Dialog(dialog.id.clone(), DialogCallback::Terminated),
            )?;
        }
        Ok(())
    }

    fn compose(&mut self, request: &Request) -> sip_core::Result<PublishCallback> {
        let expires = request
            .header("Expires")
            .and_then(parse_delta_seconds)
            .unwrap_or(self.granted_expires);

        if let Some(if_match) = request.header("SIP-If-Match") {
            if self.etag.as_deref() != Some(if_match) {
                warn!("compositor: unknown entity tag {if_match}");
                return Ok(PublishCallback::Reject(build_response(
                    412,
                    "Conditional Request Failed",
                    &[],
                )?));
            }
        } else if request.body.is_none() {
            return Ok(PublishCallback::Reject(build_response(400, "Bad Request", &[])?));
        }

        if expires == 0 {
            let etag = self.etag.take().unwrap_or_default();
            self.document.set(None);
            info!("compositor: publication {etag} removed");
            return Ok(PublishCallback::Accept(build_response(
                200,
                "OK",
                &[("SIP-ETag", &etag), ("Expires", "0")],
            )?));
        }
        if expires < self.min_expires {
            let min = self.min_expires.to_string();
            return Ok(PublishCallback::Reject(build_response(
                423,
                "Interval Too Brief",
                &[("Min-Expires", &min)],
            )?));
        }

        if let Some(body) = &request.body {
            self.document.set(Some(body.clone()));
        }
        let etag = random_token();
        let granted = expires.min(self.granted_expires);
        info!("compositor: holding {etag} for {granted}s");
        self.etag = Some(etag.clone());
        Ok(PublishCallback::Accept(build_response(
            200,
            "OK",
            &[("SIP-ETag", &etag), ("Expires", &granted.to_string())],
        )?))
    }
}

impl RequestCore for LoopbackCore {
    fn make_outgoing_request(
        &mut self,
        method: Method,
        target: &str,
        from: &str,
        to: &str,
        params: &RequestParams,
        extra_headers: &[Header],
        body: Option<&Body>,
    ) -> sip_core::Result<Request> {
        self.cseq += 1;
        let call_id = params
            .call_id
            .clone()
            .unwrap_or_else(|| format!("{}@127.0.0.1", random_token()));
        let from_tag = params.from_tag.clone().unwrap_or_else(random_token);
        let to = match &params.to_tag {
            Some(tag) => format!("<{to}>;tag={tag}"),
            None => format!("<{to}>"),
        };

        let mut req = Request::new(method, target)?;
        req.add_header(Header::new(
            "Via",
            &format!("SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{}", random_token()),
        )?)?;
        req.add_header(Header::new("Max-Forwards", "70")?)?;
        req.add_header(Header::new("From", &format!("<{from}>;tag={from_tag}"))?)?;
        req.add_header(Header::new("To", &to)?)?;
        req.add_header(Header::new("Call-ID", &call_id)?)?;
        req.add_header(Header::new("CSeq", &format!("{} {method}", self.cseq))?)?;
        for header in extra_headers {
            req.add_header(header.clone())?;
        }
        if let Some(body) = body {
            req.set_body(body.clone());
        }
        Ok(req)
    }

    fn subscribe(&mut self, request: Request) -> sip_core::Result<RequestId> {
        let request = over_the_wire(&request)?;
        let id = self.ids.next();
        let call_id = request
            .header("Call-ID")
            .ok_or(SipError::Invalid("SUBSCRIBE without Call-ID"))?;
        let local_tag = request
            .header("From")
            .and_then(tag_param)
            .ok_or(SipError::Invalid("SUBSCRIBE without From tag"))?;
        let event = request.header("Event").unwrap_or("presence").to_string();
        let contact = request.header("Contact").unwrap_or(request.uri.as_str()).to_string();
        let expires = request
            .header("Expires")
            .and_then(parse_delta_seconds)
            .unwrap_or(self.granted_expires)
            .min(self.granted_expires);

        let dialog_id = SipDialogId::new(call_id, local_tag, &random_token());
        info!("notifier: SUBSCRIBE {id} accepted as dialog {dialog_id}");
        let state = Rc::new(Cell::new(SubscriptionDialogState::Active));
        self.dialogs.push(NotifierDialog {
            id: dialog_id.clone(),
            event: event.clone(),
            contact: contact.clone(),
            state: state.clone(),
        });

        let accept = build_response(200, "OK", &[("Expires", &expires.to_string())])?;
        deliver(&self.outbox, Delivery::Subscribe(id, SubscribeCallback::Accept(accept)))?;

        let subscription_state = format!("active;expires={expires}");
        let notify = build_notify(&contact, &dialog_id, &event, &subscription_state, &self.document)?;
        let dialog = LoopbackDialog {
            id: dialog_id,
            event,
            contact,
            expires,
            state,
            auto_refresh: false,
            ids: self.ids.clone(),
            document: self.document.clone(),
            outbox: self.outbox.clone(),
        };
        deliver(
            &self.outbox,
            Delivery::Subscribe(
                id,
                SubscribeCallback::Notify(NotifyResult {
                    dialog: Some(Box::new(dialog)),
                    request: notify,
                }),
            ),
        )?;
        Ok(id)
    }

    fn publish(&mut self, request: Request) -> sip_core::Result<RequestId> {
        let request = over_the_wire(&request)?;
        let id = self.ids.next();
        deliver(
            &self.outbox,
            Delivery::Publish(id, PublishCallback::Trying(build_response(100, "Trying", &[])?)),
        )?;
        let answer = self.compose(&request)?;
        debug!(
            "compositor: PUBLISH {id} ({:?}) answered {}",
            header_value(&request.headers, "SIP-If-Match"),
            answer.response().status_code
        );
        if log_enabled!(Level::Trace) {
            if let Ok(text) = answer.response().render::<MAX_RENDER_LEN>() {
                trace!("wire:\n{text}");
            }
        }
        deliver(&self.outbox, Delivery::Publish(id, answer))?;
        Ok(id)
    }

    fn wait_notify_stop(&mut self, id: RequestId) {
        debug!("Timer N stopped for {id}");
    }

    fn dispose_request(&mut self, id: RequestId) {
        debug!("released {id}");
    }
}

/// PIDF document carrying a basic status.
pub fn presence_document(entity: &str, status: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <presence xmlns=\"urn:ietf:params:xml:ns:pidf\" entity=\"{entity}\">\
         <tuple id=\"t1\"><status><basic>{status}</basic></status></tuple></presence>"
    )
}
