use core::fmt;

use crate::{request_core::RequestId, Result};

/// State of an established subscription dialog, as reported by the dialog layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDialogState {
    #[default]
    Initial,
    NotifyWait,
    Pending,
    Active,
    Terminated,
}

impl SubscriptionDialogState {
    /// Pending and active dialogs still hold server-side state worth removing.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SubscriptionDialogState::Pending | SubscriptionDialogState::Active
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipDialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl SipDialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }
}

impl fmt::Display for SipDialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// The dialog layer's view of one established subscription.
///
/// Implementations own their own transaction plumbing. Requests they send
/// are identified by the returned [`RequestId`]; responses come back to the
/// engine as [`InDialogCallback`](crate::InDialogCallback)s and dialog-level
/// happenings as [`DialogCallback`](crate::DialogCallback)s.
pub trait SubscriptionDialog: fmt::Debug {
    fn id(&self) -> &SipDialogId;

    fn state(&self) -> SubscriptionDialogState;

    fn auto_refresh(&self) -> bool;

    /// When enabled the dialog re-SUBSCRIBEs on its own before expiry and
    /// reports each attempt through `DialogCallback::Refresh`.
    fn set_auto_refresh(&mut self, enabled: bool);

    /// Send a re-SUBSCRIBE within the dialog.
    fn refresh(&mut self) -> Result<RequestId>;

    /// Send a SUBSCRIBE with `Expires: 0`.
    fn unsubscribe(&mut self) -> Result<RequestId>;
}
