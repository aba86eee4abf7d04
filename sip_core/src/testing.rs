//! Test doubles for the request core, subscription dialogs and NOTIFY
//! responders.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{
    dialog::{SipDialogId, SubscriptionDialog, SubscriptionDialogState},
    message::{Body, Header, Method, Request, Response},
    notification::{IncomingNotify, NotifyResponder},
    request_core::{RequestCore, RequestId, RequestParams},
    Result,
};

/// Status codes sent by a [`RecordingResponder`].
pub type ResponseLog = Rc<RefCell<Vec<u16>>>;

#[derive(Debug)]
pub struct RecordingResponder {
    log: ResponseLog,
}

impl RecordingResponder {
    pub fn new() -> (Self, ResponseLog) {
        Self::with_log(ResponseLog::default())
    }

    pub fn with_log(log: ResponseLog) -> (Self, ResponseLog) {
        (Self { log: log.clone() }, log)
    }
}

impl NotifyResponder for RecordingResponder {
    fn respond(&mut self, status_code: u16, _reason: &str) -> Result<()> {
        self.log.borrow_mut().push(status_code);
        Ok(())
    }
}

fn notify_request(state: &str) -> Request {
    let mut req = Request::new(Method::Notify, "sip:alice@192.0.2.1").unwrap();
    req.add_header(Header::new("Event", "presence").unwrap())
        .unwrap();
    req.add_header(Header::new("Subscription-State", state).unwrap())
        .unwrap();
    req
}

/// A NOTIFY whose response nobody looks at.
pub fn notify(state: &str) -> IncomingNotify {
    let (responder, _) = RecordingResponder::new();
    IncomingNotify::new(notify_request(state), Box::new(responder))
}

pub fn notify_logged(state: &str, log: &ResponseLog) -> IncomingNotify {
    let (responder, _) = RecordingResponder::with_log(log.clone());
    IncomingNotify::new(notify_request(state), Box::new(responder))
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        200 => "OK",
        202 => "Accepted",
        302 => "Moved Temporarily",
        403 => "Forbidden",
        412 => "Conditional Request Failed",
        423 => "Interval Too Brief",
        481 => "Call/Transaction Does Not Exist",
        489 => "Bad Event",
        500 => "Server Internal Error",
        _ => "Unknown",
    }
}

pub fn response(code: u16) -> Response {
    Response::new(code, reason_phrase(code)).unwrap()
}

pub fn response_with(code: u16, headers: &[(&str, &str)]) -> Response {
    let mut resp = response(code);
    for (name, value) in headers {
        resp.add_header(Header::new(name, value).unwrap()).unwrap();
    }
    resp
}

thread_local! {
    // Dialog-issued ids live far away from the core's so they never collide.
    static NEXT_DIALOG_REQUEST: Cell<u64> = const { Cell::new(10_000) };
    static NEXT_DIALOG: Cell<u64> = const { Cell::new(1) };
}

fn next_dialog_request() -> RequestId {
    NEXT_DIALOG_REQUEST.with(|n| {
        let id = n.get();
        n.set(id + 1);
        RequestId(id)
    })
}

#[derive(Debug)]
pub struct DialogProbe {
    pub state: SubscriptionDialogState,
    pub auto_refresh: bool,
    pub refreshes: Vec<RequestId>,
    pub unsubscribes: Vec<RequestId>,
}

/// Shared view into a [`MockDialog`] after it has been boxed away.
pub type DialogHandle = Rc<RefCell<DialogProbe>>;

#[derive(Debug)]
pub struct MockDialog {
    id: SipDialogId,
    probe: DialogHandle,
}

impl MockDialog {
    pub fn new(state: SubscriptionDialogState) -> (Self, DialogHandle) {
        let n = NEXT_DIALOG.with(|n| {
            let v = n.get();
            n.set(v + 1);
            v
        });
        let probe = Rc::new(RefCell::new(DialogProbe {
            state,
            auto_refresh: false,
            refreshes: Vec::new(),
            unsubscribes: Vec::new(),
        }));
        let dialog = Self {
            id: SipDialogId::new(&format!("dialog-{n}"), "local", &format!("remote-{n}")),
            probe: probe.clone(),
        };
        (dialog, probe)
    }
}

impl SubscriptionDialog for MockDialog {
    fn id(&self) -> &SipDialogId {
        &self.id
    }

    fn state(&self) -> SubscriptionDialogState {
        self.probe.borrow().state
    }

    fn auto_refresh(&self) -> bool {
        self.probe.borrow().auto_refresh
    }

    fn set_auto_refresh(&mut self, enabled: bool) {
        self.probe.borrow_mut().auto_refresh = enabled;
    }

    fn refresh(&mut self) -> Result<RequestId> {
        let id = next_dialog_request();
        self.probe.borrow_mut().refreshes.push(id);
        Ok(id)
    }

    fn unsubscribe(&mut self) -> Result<RequestId> {
        let id = next_dialog_request();
        self.probe.borrow_mut().unsubscribes.push(id);
        Ok(id)
    }
}

/// Records everything the engines hand to the request core.
#[derive(Debug, Default)]
pub struct MockCore {
    next_call: u64,
    next_request: u64,
    subscribes: Vec<(RequestId, Request)>,
    publishes: Vec<(RequestId, Request)>,
    stopped: Vec<RequestId>,
    disposed: Vec<RequestId>,
}

impl MockCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_subscribes(&self) -> &[(RequestId, Request)] {
        &self.subscribes
    }

    pub fn sent_publishes(&self) -> &[(RequestId, Request)] {
        &self.publishes
    }

    pub fn last_subscribe_id(&self) -> RequestId {
        self.subscribes.last().map(|(id, _)| *id).unwrap()
    }

    pub fn last_publish_id(&self) -> RequestId {
        self.publishes.last().map(|(id, _)| *id).unwrap()
    }

    pub fn last_publish(&self) -> &Request {
        self.publishes.last().map(|(_, req)| req).unwrap()
    }

    pub fn notify_waits_stopped(&self) -> Vec<RequestId> {
        self.stopped.clone()
    }

    pub fn disposed_requests(&self) -> Vec<RequestId> {
        self.disposed.clone()
    }

    fn allocate_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }
}

impl RequestCore for MockCore {
    fn make_outgoing_request(
        &mut self,
        method: Method,
        target: &str,
        from: &str,
        to: &str,
        params: &RequestParams,
        extra_headers: &[Header],
        body: Option<&Body>,
    ) -> Result<Request> {
        self.next_call += 1;
        let n = self.next_call;
        let call_id = params.call_id.clone().unwrap_or_else(|| format!("call-{n}"));
        let from_tag = params.from_tag.clone().unwrap_or_else(|| format!("tag-{n}"));
        let to = match &params.to_tag {
            Some(tag) => format!("<{to}>;tag={tag}"),
            None => format!("<{to}>"),
        };

        let mut req = Request::new(method, target)?;
        req.add_header(Header::new("Call-ID", &call_id)?)?;
        req.add_header(Header::new("From", &format!("<{from}>;tag={from_tag}"))?)?;
        req.add_header(Header::new("To", &to)?)?;
        req.add_header(Header::new("CSeq", &format!("1 {method}"))?)?;
        for header in extra_headers {
            req.add_header(header.clone())?;
        }
        if let Some(body) = body {
            req.set_body(body.clone());
        }
        Ok(req)
    }

    fn subscribe(&mut self, request: Request) -> Result<RequestId> {
        let id = self.allocate_id();
        self.subscribes.push((id, request));
        Ok(id)
    }

    fn publish(&mut self, request: Request) -> Result<RequestId> {
        let id = self.allocate_id();
        self.publishes.push((id, request));
        Ok(id)
    }

    fn wait_notify_stop(&mut self, id: RequestId) {
        self.stopped.push(id);
    }

    fn dispose_request(&mut self, id: RequestId) {
        self.disposed.push(id);
    }
}
