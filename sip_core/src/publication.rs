use core::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    config::{PublicationOptions, UserAgentConfig},
    headers::{parse_delta_seconds, parse_entity_tag},
    message::{Body, Header, Method, Response},
    request_core::{PublishCallback, RequestCore, RequestId, RequestParams},
    timer::Timer,
    Disposal, Result, SipError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    #[default]
    Initial,
    Published,
    Unpublished,
    Terminated,
}

impl PublicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationState::Initial => "Initial",
            PublicationState::Published => "Published",
            PublicationState::Unpublished => "Unpublished",
            PublicationState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for PublicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `target:event`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicationId(String);

impl PublicationId {
    pub fn new(target: &str, event: &str) -> Self {
        Self(format!("{target}:{event}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationEvent {
    StateChanged(PublicationState),
    Disposed,
}

/// Refresh lead: 90% of the granted interval.
pub fn refresh_delay(expires: u32) -> Duration {
    Duration::from_millis(u64::from(expires) * 900)
}

/// Publisher side of one event state publication (RFC 3903).
#[derive(Debug)]
pub struct Publication {
    id: PublicationId,
    target: String,
    event: String,
    from_uri: String,
    to_uri: String,
    params: RequestParams,
    extra_headers: Vec<Header>,
    content_type: String,
    configured_expires: u32,
    unpublish_on_close: bool,

    state: PublicationState,
    disposed: bool,
    disposal_pending: bool,

    /// Interval requested on the next PUBLISH; 0 means nothing is held.
    expires: u32,
    etag: Option<String>,
    /// Last content handed to `publish`, kept for 412/423 recovery.
    content: Option<Body>,
    /// Body carried by the next PUBLISH.
    pending_body: Option<Body>,
    outstanding: Vec<RequestId>,
    refresh_timer: Timer,

    events: Vec<PublicationEvent>,
}

impl Publication {
    pub fn new(
        config: &UserAgentConfig,
        target: &str,
        event: &str,
        options: PublicationOptions,
    ) -> Self {
        Self {
            id: PublicationId::new(target, event),
            target: target.to_string(),
            event: event.to_string(),
            from_uri: options.from_uri.unwrap_or_else(|| config.aor.clone()),
            to_uri: options.to_uri.unwrap_or_else(|| target.to_string()),
            params: options.params,
            extra_headers: options.extra_headers,
            content_type: options.content_type,
            configured_expires: options.expires,
            unpublish_on_close: options.unpublish_on_close,
            state: PublicationState::Initial,
            disposed: false,
            disposal_pending: false,
            expires: options.expires,
            etag: None,
            content: None,
            pending_body: None,
            outstanding: Vec::new(),
            refresh_timer: Timer::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &PublicationId {
        &self.id
    }

    pub fn state(&self) -> PublicationState {
        self.state
    }

    pub fn entity_tag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Currently granted (or requested) interval in seconds.
    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_finished(&self) -> bool {
        self.disposed && !self.disposal_pending
    }

    pub fn owns_request(&self, id: RequestId) -> bool {
        self.outstanding.contains(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.refresh_timer.deadline()
    }

    pub fn take_events(&mut self) -> Vec<PublicationEvent> {
        std::mem::take(&mut self.events)
    }

    /// Publish `content` as the new event state. Content longer than
    /// [`MAX_BODY_LEN`](crate::message::MAX_BODY_LEN) bytes fails with
    /// [`SipError::Capacity`].
    pub fn publish(&mut self, core: &mut dyn RequestCore, content: &[u8]) -> Result<()> {
        let body = Body::new(&self.content_type, content)?;
        self.publish_body(core, body)
    }

    fn publish_body(&mut self, core: &mut dyn RequestCore, body: Body) -> Result<()> {
        if self.state == PublicationState::Terminated {
            return Err(SipError::InvalidState("publication terminated"));
        }
        self.refresh_timer.cancel();
        self.content = Some(body.clone());
        self.pending_body = Some(body);
        if self.expires == 0 {
            // first publish after an unpublish starts a new publication
            self.expires = self.configured_expires;
            self.etag = None;
        }
        self.send(core)
    }

    pub fn unpublish(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        self.refresh_timer.cancel();
        self.pending_body = None;
        self.expires = 0;
        if self.etag.is_some() {
            self.send(core)
        } else {
            debug!("publication {}: nothing to unpublish", self.id);
            Ok(())
        }
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
        info!("publication {} in state {} is being disposed", self.id, self.state);

        if self.unpublish_on_close && self.state == PublicationState::Published {
            let sent = self.outstanding.len();
            self.unpublish(core)?;
            // Only the removal's own answer may complete the disposal.
            if let Some(removal) = self.outstanding.get(sent).copied() {
                self.outstanding.retain(|id| *id == removal);
                self.disposal_pending = true;
                return Ok(Disposal::Pending);
            }
        }
        self.release();
        Ok(Disposal::Complete)
    }

    pub fn on_publish_callback(
        &mut self,
        core: &mut dyn RequestCore,
        now: Instant,
        id: RequestId,
        callback: PublishCallback,
    ) -> Result<()> {
        if !self.outstanding.contains(&id) {
            debug!("publication {}: dropping callback for stale {id}", self.id);
            return Ok(());
        }
        if callback.is_final() {
            self.outstanding.retain(|r| *r != id);
        }
        self.receive_response(core, now, &callback.into_response())
    }

    /// Fire the refresh timer if it is due.
    pub fn poll(&mut self, core: &mut dyn RequestCore, now: Instant) -> Result<()> {
        if self.refresh_timer.fire(now) {
            return self.refresh(core);
        }
        Ok(())
    }

    fn refresh(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        if self.etag.is_none() {
            return Err(SipError::InvalidState("refresh without an entity tag"));
        }
        if self.expires == 0 {
            return Err(SipError::InvalidState("refresh of a removed publication"));
        }
        debug!("publication {} refreshing", self.id);
        self.pending_body = self.content.clone();
        self.send(core)
    }

    fn receive_response(
        &mut self,
        core: &mut dyn RequestCore,
        now: Instant,
        response: &Response,
    ) -> Result<()> {
        match response.status_code {
            _ if response.is_provisional() => {}
            _ if response.is_success() => self.on_success(now, response)?,
            412 => self.on_conditional_request_failed(core)?,
            423 => self.on_interval_too_brief(core, response)?,
            code => {
                warn!("publication {}: PUBLISH failed with {code}", self.id);
                self.give_up()?;
            }
        }

        if self.expires == 0 {
            self.refresh_timer.cancel();
            self.pending_body = None;
            self.etag = None;
        }

        if self.disposal_pending
            && matches!(
                self.state,
                PublicationState::Unpublished | PublicationState::Terminated
            )
        {
            self.disposal_pending = false;
            self.release();
        }
        Ok(())
    }

    fn on_success(&mut self, now: Instant, response: &Response) -> Result<()> {
        match response.header("SIP-ETag").and_then(parse_entity_tag) {
            Some(etag) => self.etag = Some(etag),
            None => warn!("SIP-ETag header missing or invalid in a 2xx response to PUBLISH"),
        }

        match response.header("Expires") {
            Some(raw) => match parse_delta_seconds(raw) {
                Some(granted) if granted <= self.expires => self.expires = granted,
                _ => warn!("bad Expires header {raw:?} in a 2xx response to PUBLISH"),
            },
            None => warn!("Expires header missing in a 2xx response to PUBLISH"),
        }

        if self.expires != 0 {
            self.refresh_timer.arm(now, refresh_delay(self.expires));
            if self.state != PublicationState::Published {
                self.transition(PublicationState::Published)?;
            }
        } else if self.state != PublicationState::Unpublished {
            self.transition(PublicationState::Unpublished)?;
        }
        Ok(())
    }

    fn on_conditional_request_failed(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        if self.etag.is_some() && self.expires != 0 {
            warn!("412 response to PUBLISH, recovering");
            self.etag = None;
            let content = self
                .content
                .clone()
                .ok_or(SipError::InvalidState("no content to republish"))?;
            self.publish_body(core, content)
        } else {
            warn!("412 response to PUBLISH, recovery failed");
            self.give_up()
        }
    }

    fn on_interval_too_brief(
        &mut self,
        core: &mut dyn RequestCore,
        response: &Response,
    ) -> Result<()> {
        let min_expires = response.header("Min-Expires").and_then(parse_delta_seconds);
        match min_expires {
            Some(min) if self.expires != 0 && min > self.expires => {
                warn!(
                    "423 response to PUBLISH, raising Expires from {} to {min}",
                    self.expires
                );
                self.expires = min;
                let content = self
                    .content
                    .clone()
                    .ok_or(SipError::InvalidState("no content to republish"))?;
                self.publish_body(core, content)
            }
            _ => {
                warn!("423 response to PUBLISH, recovery failed");
                self.give_up()
            }
        }
    }

    fn give_up(&mut self) -> Result<()> {
        self.expires = 0;
        if self.state != PublicationState::Unpublished {
            self.transition(PublicationState::Unpublished)?;
        }
        self.transition(PublicationState::Terminated)
    }

    fn send(&mut self, core: &mut dyn RequestCore) -> Result<()> {
        let mut headers = self.extra_headers.clone();
        headers.push(Header::new("Event", &self.event)?);
        headers.push(Header::new("Expires", &self.expires.to_string())?);
        if let Some(etag) = &self.etag {
            headers.push(Header::new("SIP-If-Match", etag)?);
        }

        let request = core.make_outgoing_request(
            Method::Publish,
            &self.target,
            &self.from_uri,
            &self.to_uri,
            &self.params,
            &headers,
            self.pending_body.as_ref(),
        )?;
        let id = core.publish(request)?;
        debug!(
            "publication {} sent PUBLISH {id} (expires {}, etag {:?})",
            self.id, self.expires, self.etag
        );
        self.outstanding.push(id);
        Ok(())
    }

    /// Drop every piece of publication state and announce disposal.
    fn release(&mut self) {
        self.refresh_timer.cancel();
        self.pending_body = None;
        self.content = None;
        self.expires = 0;
        self.etag = None;
        self.outstanding.clear();
        self.events.push(PublicationEvent::Disposed);
    }

    fn transition(&mut self, to: PublicationState) -> Result<()> {
        use PublicationState::*;

        let legal = matches!(
            (self.state, to),
            (Initial, Published)
                | (Initial, Unpublished)
                | (Initial, Terminated)
                | (Published, Unpublished)
                | (Published, Terminated)
                | (Unpublished, Published)
                | (Unpublished, Terminated)
        );
        if !legal {
            return Err(SipError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }

        self.state = to;
        info!("publication {} transitioned to {to}", self.id);
        self.events.push(PublicationEvent::StateChanged(to));

        if to == Terminated && !self.disposed {
            self.disposed = true;
            self.release();
        }
        Ok(())
    }
}
