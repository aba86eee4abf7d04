//! Sans-IO SIP event framework: subscriptions (RFC 6665) and event state
//! publication (RFC 3903) on top of a pluggable request core.

use thiserror::Error;

pub mod config;
pub mod dialog;
pub mod headers;
pub mod message;
pub mod notification;
pub mod publication;
pub mod request_core;
pub mod subscriber_request;
pub mod subscription;
pub mod timer;
pub mod user_agent;

#[cfg(test)]
mod testing;

pub use config::{PublicationOptions, SubscriptionOptions, UserAgentConfig};
pub use dialog::{SipDialogId, SubscriptionDialog, SubscriptionDialogState};
pub use message::{Body, Header, Method, Request, Response};
pub use notification::{IncomingNotify, Notification, NotifyResponder};
pub use publication::{Publication, PublicationEvent, PublicationId, PublicationState};
pub use request_core::{
    DialogCallback, InDialogCallback, NotifyResult, PublishCallback, RequestCore, RequestId,
    RequestParams, SubscribeCallback,
};
pub use subscription::{
    Subscription, SubscriptionDelegate, SubscriptionEvent, SubscriptionId, SubscriptionState,
};
pub use user_agent::{UserAgent, UserAgentEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("capacity exceeded")]
    Capacity,
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("duplicate id {0}")]
    Duplicate(String),
    #[error("unknown id {0}")]
    NotFound(String),
    #[error("request core: {0}")]
    Core(String),
}

pub type Result<T> = std::result::Result<T, SipError>;

/// Outcome of disposing an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// All resources are released.
    Complete,
    /// Waiting on the network; a `Disposed` event follows.
    Pending,
}
