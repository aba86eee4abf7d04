use crate::{
    message::{Body, Header, Method},
    request_core::RequestParams,
};

pub const DEFAULT_SUBSCRIPTION_EXPIRES: u32 = 3600;
pub const DEFAULT_PUBLICATION_EXPIRES: u32 = 3600;
pub const DEFAULT_PUBLICATION_CONTENT_TYPE: &str = "text/plain";

/// Identity of the local user agent, shared by every engine it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentConfig {
    /// Address of record, used as the From URI.
    pub aor: String,
    pub contact: String,
    /// Methods advertised in `Allow`.
    pub allowed_methods: Vec<Method>,
}

impl UserAgentConfig {
    pub fn new(aor: &str, contact: &str) -> Self {
        Self {
            aor: aor.to_string(),
            contact: contact.to_string(),
            ..Self::default()
        }
    }

    pub fn allow_header_value(&self) -> String {
        self.allowed_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            aor: "sip:anonymous@anonymous.invalid".to_string(),
            contact: "sip:anonymous@anonymous.invalid".to_string(),
            allowed_methods: vec![Method::Notify, Method::Options],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub expires: u32,
    pub extra_headers: Vec<Header>,
    pub body: Option<Body>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            expires: DEFAULT_SUBSCRIPTION_EXPIRES,
            extra_headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationOptions {
    pub expires: u32,
    pub content_type: String,
    pub unpublish_on_close: bool,
    pub extra_headers: Vec<Header>,
    /// Defaults to the user agent's AOR.
    pub from_uri: Option<String>,
    /// Defaults to the publication target.
    pub to_uri: Option<String>,
    pub params: RequestParams,
}

impl Default for PublicationOptions {
    fn default() -> Self {
        Self {
            expires: DEFAULT_PUBLICATION_EXPIRES,
            content_type: DEFAULT_PUBLICATION_CONTENT_TYPE.to_string(),
            unpublish_on_close: true,
            extra_headers: Vec::new(),
            from_uri: None,
            to_uri: None,
            params: RequestParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let sub = SubscriptionOptions::default();
        assert_eq!(sub.expires, 3600);
        let publ = PublicationOptions::default();
        assert_eq!(publ.expires, 3600);
        assert_eq!(publ.content_type, "text/plain");
        assert!(publ.unpublish_on_close);
    }

    #[test]
    fn allow_lists_methods() {
        let mut cfg = UserAgentConfig::new("sip:alice@example.com", "sip:alice@192.0.2.1");
        assert_eq!(cfg.allow_header_value(), "NOTIFY,OPTIONS");
        cfg.allowed_methods.push(Method::Subscribe);
        assert_eq!(cfg.allow_header_value(), "NOTIFY,OPTIONS,SUBSCRIBE");
    }
}
