//! Contract with the request core: the layer that builds, sends and
//! correlates requests and runs the transaction timers (including Timer N).

use core::fmt;

use crate::{
    dialog::SubscriptionDialog,
    message::{Body, Header, Method, Request, Response},
    notification::IncomingNotify,
    Result,
};

/// Handle for one outgoing request, assigned by the request core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Overrides for the identifiers the core would otherwise generate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub call_id: Option<String>,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
}

pub trait RequestCore {
    /// Build an out-of-dialog request. The core fills in Call-ID, CSeq,
    /// Via, Max-Forwards and a From tag unless `params` overrides them.
    #[allow(clippy::too_many_arguments)]
    fn make_outgoing_request(
        &mut self,
        method: Method,
        target: &str,
        from: &str,
        to: &str,
        params: &RequestParams,
        extra_headers: &[Header],
        body: Option<&Body>,
    ) -> Result<Request>;

    /// Send a SUBSCRIBE. Outcomes are delivered as [`SubscribeCallback`]s.
    fn subscribe(&mut self, request: Request) -> Result<RequestId>;

    /// Send a PUBLISH. Outcomes are delivered as [`PublishCallback`]s.
    fn publish(&mut self, request: Request) -> Result<RequestId>;

    /// Stop waiting for the first NOTIFY (Timer N) of a SUBSCRIBE.
    fn wait_notify_stop(&mut self, id: RequestId);

    /// Release whatever the core still holds for `id`.
    fn dispose_request(&mut self, id: RequestId);
}

/// First NOTIFY of a SUBSCRIBE, with the dialog it created (if any).
#[derive(Debug)]
pub struct NotifyResult {
    pub dialog: Option<Box<dyn SubscriptionDialog>>,
    pub request: IncomingNotify,
}

#[derive(Debug)]
pub enum SubscribeCallback {
    /// 2xx final response.
    Accept(Response),
    Notify(NotifyResult),
    /// Timer N fired without a NOTIFY.
    NotifyTimeout,
    Redirect(Response),
    Reject(Response),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishCallback {
    Trying(Response),
    Progress(Response),
    Accept(Response),
    Redirect(Response),
    Reject(Response),
}

impl PublishCallback {
    pub fn response(&self) -> &Response {
        match self {
            PublishCallback::Trying(r)
            | PublishCallback::Progress(r)
            | PublishCallback::Accept(r)
            | PublishCallback::Redirect(r)
            | PublishCallback::Reject(r) => r,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, PublishCallback::Trying(_) | PublishCallback::Progress(_))
    }

    pub fn into_response(self) -> Response {
        match self {
            PublishCallback::Trying(r)
            | PublishCallback::Progress(r)
            | PublishCallback::Accept(r)
            | PublishCallback::Redirect(r)
            | PublishCallback::Reject(r) => r,
        }
    }
}

/// Final response to a request sent inside a subscription dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InDialogCallback {
    Accept(Response),
    Redirect(Response),
    Reject(Response),
}

/// Events raised by an established subscription dialog.
#[derive(Debug)]
pub enum DialogCallback {
    Notify(IncomingNotify),
    /// The dialog sent an automatic refresh identified by this request.
    Refresh(RequestId),
    Terminated,
}
