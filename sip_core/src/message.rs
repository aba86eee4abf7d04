use core::fmt::Write;
use heapless::{String, Vec};

use crate::{Result, SipError};

pub const MAX_URI_LEN: usize = 128;
pub const MAX_HEADER_NAME: usize = 32;
pub const MAX_HEADER_VALUE: usize = 256;
pub const MAX_REASON_LEN: usize = 64;
pub const MAX_CONTENT_TYPE_LEN: usize = 64;
pub const MAX_BODY_LEN: usize = 8192;
pub const MAX_HEADERS: usize = 24;
pub const MAX_RENDER_LEN: usize = 16384;

pub type SmallString<const N: usize> = String<N>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Options,
    Subscribe,
    Notify,
    Publish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const SIP_2_0: Version = Version { major: 2, minor: 0 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmallString<MAX_HEADER_NAME>,
    pub value: SmallString<MAX_HEADER_VALUE>,
}

pub type HeaderList = Vec<Header, MAX_HEADERS>;

/// Opaque message payload of at most `MAX_BODY_LEN` bytes. The engines never
/// look inside `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: SmallString<MAX_CONTENT_TYPE_LEN>,
    pub content: Vec<u8, MAX_BODY_LEN>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SmallString<MAX_URI_LEN>,
    pub version: Version,
    pub headers: HeaderList,
    pub body: Option<Body>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status_code: u16,
    pub reason: SmallString<MAX_REASON_LEN>,
    pub headers: HeaderList,
    pub body: Option<Body>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Header {
    pub fn new(name: &str, value: &str) -> Result<Self> {
        let mut name_buf: SmallString<MAX_HEADER_NAME> = SmallString::new();
        name_buf.push_str(name).map_err(|_| SipError::Capacity)?;
        let mut value_buf: SmallString<MAX_HEADER_VALUE> = SmallString::new();
        value_buf.push_str(value).map_err(|_| SipError::Capacity)?;
        Ok(Header {
            name: name_buf,
            value: value_buf,
        })
    }

    /// Parse a raw `Name: value` header line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.splitn(2, ':');
        let name = parts.next().ok_or(SipError::Invalid("header name"))?.trim();
        let value = parts
            .next()
            .ok_or(SipError::Invalid("header value"))?
            .trim();
        if name.is_empty() {
            return Err(SipError::Invalid("header name"));
        }
        Header::new(name, value)
    }
}

impl Body {
    pub fn new(content_type: &str, content: &[u8]) -> Result<Self> {
        let mut ct: SmallString<MAX_CONTENT_TYPE_LEN> = SmallString::new();
        ct.push_str(content_type).map_err(|_| SipError::Capacity)?;
        let mut buf: Vec<u8, MAX_BODY_LEN> = Vec::new();
        buf.extend_from_slice(content)
            .map_err(|_| SipError::Capacity)?;
        Ok(Self {
            content_type: ct,
            content: buf,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        let mut uri_buf: SmallString<MAX_URI_LEN> = SmallString::new();
        uri_buf.push_str(uri).map_err(|_| SipError::Capacity)?;

        Ok(Self {
            method,
            uri: uri_buf,
            version: Version::SIP_2_0,
            headers: HeaderList::new(),
            body: None,
        })
    }

    pub fn add_header(&mut self, header: Header) -> Result<()> {
        self.headers.push(header).map_err(|_| SipError::Capacity)
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn render<const N: usize>(&self) -> Result<SmallString<N>> {
        let mut out: SmallString<N> = SmallString::new();
        write!(
            out,
            "{} {} SIP/{}.{}\r\n",
            self.method, self.uri, self.version.major, self.version.minor
        )
        .map_err(|_| SipError::Capacity)?;
        render_tail(&mut out, &self.headers, self.body.as_ref())?;
        Ok(out)
    }
}

impl Response {
    pub fn new(status_code: u16, reason: &str) -> Result<Self> {
        let mut reason_buf: SmallString<MAX_REASON_LEN> = SmallString::new();
        reason_buf
            .push_str(reason)
            .map_err(|_| SipError::Capacity)?;

        Ok(Self {
            version: Version::SIP_2_0,
            status_code,
            reason: reason_buf,
            headers: HeaderList::new(),
            body: None,
        })
    }

    pub fn add_header(&mut self, header: Header) -> Result<()> {
        self.headers.push(header).map_err(|_| SipError::Capacity)
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn render<const N: usize>(&self) -> Result<SmallString<N>> {
        let mut out: SmallString<N> = SmallString::new();
        write!(
            out,
            "SIP/{}.{} {} {}\r\n",
            self.version.major, self.version.minor, self.status_code, self.reason
        )
        .map_err(|_| SipError::Capacity)?;
        render_tail(&mut out, &self.headers, self.body.as_ref())?;
        Ok(out)
    }
}

/// Bodies are rendered as text; bytes that are not UTF-8 are replaced.
fn render_tail<const N: usize>(
    out: &mut SmallString<N>,
    headers: &HeaderList,
    body: Option<&Body>,
) -> Result<()> {
    for header in headers {
        write!(out, "{}: {}\r\n", header.name, header.value).map_err(|_| SipError::Capacity)?;
    }
    match body {
        Some(body) => {
            let text = std::string::String::from_utf8_lossy(body.as_bytes());
            write!(
                out,
                "Content-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
                body.content_type,
                body.len(),
                text
            )
            .map_err(|_| SipError::Capacity)?;
        }
        None => {
            out.push_str("Content-Length: 0\r\n\r\n")
                .map_err(|_| SipError::Capacity)?;
        }
    }
    Ok(())
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
        }
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Method {
    type Err = SipError;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "REGISTER" => Ok(Method::Register),
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            "OPTIONS" => Ok(Method::Options),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            "NOTIFY" => Ok(Method::Notify),
            "PUBLISH" => Ok(Method::Publish),
            _ => Err(SipError::Invalid("unknown method")),
        }
    }
}

// Basic parser: decide request vs response by first line.
pub fn parse_message(input: &str) -> Result<Message> {
    let mut lines = input.split("\r\n");
    let first = lines.next().ok_or(SipError::Invalid("empty message"))?;

    if first.starts_with("SIP/") {
        parse_response(first, &mut lines)
    } else {
        parse_request(first, &mut lines)
    }
}

fn parse_request<'a, I>(start_line: &str, lines: &mut I) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let method = parts.next().ok_or(SipError::Invalid("missing method"))?;
    let uri = parts.next().ok_or(SipError::Invalid("missing uri"))?;
    let _version = parts.next().ok_or(SipError::Invalid("missing version"))?;

    let mut req = Request::new(method.parse()?, uri)?;
    req.body = parse_headers_and_body(lines, &mut req.headers)?;
    Ok(Message::Request(req))
}

fn parse_response<'a, I>(start_line: &str, lines: &mut I) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if !version.starts_with("SIP/2.0") {
        return Err(SipError::Invalid("unsupported version"));
    }
    let status: u16 = parts
        .next()
        .ok_or(SipError::Invalid("missing status"))?
        .parse()
        .map_err(|_| SipError::Invalid("status parse"))?;

    let mut reason: SmallString<MAX_REASON_LEN> = SmallString::new();
    for part in parts {
        if !reason.is_empty() {
            reason.push(' ').map_err(|_| SipError::Capacity)?;
        }
        reason.push_str(part).map_err(|_| SipError::Capacity)?;
    }

    let mut resp = Response::new(status, &reason)?;
    resp.body = parse_headers_and_body(lines, &mut resp.headers)?;
    Ok(Message::Response(resp))
}

fn parse_headers_and_body<'a, I>(lines: &mut I, headers: &mut HeaderList) -> Result<Option<Body>>
where
    I: Iterator<Item = &'a str>,
{
    let mut content_type = None;
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        let header = Header::parse_line(line)?;
        // Content-Type and Content-Length describe the body, not the message.
        if header.name.eq_ignore_ascii_case("Content-Type") {
            content_type = Some(header.value);
            continue;
        }
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        headers.push(header).map_err(|_| SipError::Capacity)?;
    }

    let mut content: Vec<u8, MAX_BODY_LEN> = Vec::new();
    let mut first = true;
    for line in lines {
        if !first {
            content
                .extend_from_slice(b"\r\n")
                .map_err(|_| SipError::Capacity)?;
        }
        first = false;
        content
            .extend_from_slice(line.as_bytes())
            .map_err(|_| SipError::Capacity)?;
    }

    match content_type {
        Some(ct) => Ok(Some(Body::new(&ct, &content)?)),
        None if content.is_empty() => Ok(None),
        None => Err(SipError::Invalid("body without Content-Type")),
    }
}

pub fn header_value<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_request_and_response() {
        let mut req = Request::new(Method::Subscribe, "sip:alice@example.com").unwrap();
        req.add_header(Header::new("Event", "presence").unwrap())
            .unwrap();
        let rendered: SmallString<MAX_RENDER_LEN> = req.render().unwrap();
        assert!(rendered.starts_with("SUBSCRIBE sip:alice@example.com SIP/2.0"));
        assert!(rendered.contains("Event: presence\r\n"));
        assert!(rendered.ends_with("Content-Length: 0\r\n\r\n"));

        let mut resp = Response::new(200, "OK").unwrap();
        resp.add_header(Header::new("SIP-ETag", "dx200xyz").unwrap())
            .unwrap();
        let rendered_resp: SmallString<MAX_RENDER_LEN> = resp.render().unwrap();
        assert!(rendered_resp.starts_with("SIP/2.0 200 OK"));
    }

    #[test]
    fn renders_body_with_content_headers() {
        let mut req = Request::new(Method::Publish, "sip:alice@example.com").unwrap();
        req.set_body(Body::new("text/plain", b"open").unwrap());
        let rendered: SmallString<MAX_RENDER_LEN> = req.render().unwrap();
        assert!(rendered.contains("Content-Type: text/plain\r\n"));
        assert!(rendered.contains("Content-Length: 4\r\n"));
        assert!(rendered.ends_with("\r\n\r\nopen"));
    }

    #[test]
    fn renders_binary_body_lossily() {
        let mut req = Request::new(Method::Publish, "sip:alice@example.com").unwrap();
        req.set_body(Body::new("application/octet-stream", &[0x6f, 0xff, 0x6b]).unwrap());
        let rendered: SmallString<MAX_RENDER_LEN> = req.render().unwrap();
        assert!(rendered.contains("Content-Length: 3\r\n"));
        assert!(rendered.ends_with("o\u{fffd}k"));
    }

    #[test]
    fn body_holds_several_kilobytes() {
        let document = vec![b'x'; 6000];
        let body = Body::new("application/pidf+xml", &document).unwrap();
        assert_eq!(body.len(), 6000);

        let oversized = vec![b'x'; MAX_BODY_LEN + 1];
        assert_eq!(
            Body::new("application/pidf+xml", &oversized),
            Err(SipError::Capacity)
        );
    }

    #[test]
    fn rendered_publish_parses_back() {
        let mut req = Request::new(Method::Publish, "sip:alice@example.com").unwrap();
        req.add_header(Header::new("From", "<sip:alice@example.com>;tag=abc").unwrap())
            .unwrap();
        req.add_header(Header::new("SIP-If-Match", "dx200xyz").unwrap())
            .unwrap();
        let document = "<presence>\r\n".repeat(400);
        req.set_body(Body::new("application/pidf+xml", document.as_bytes()).unwrap());

        let rendered: SmallString<MAX_RENDER_LEN> = req.render().unwrap();
        match parse_message(&rendered).unwrap() {
            Message::Request(parsed) => assert_eq!(parsed, req),
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn parses_notify_with_body() {
        let raw = "NOTIFY sip:bob@192.0.2.4 SIP/2.0\r\n\
                   Subscription-State: active;expires=600\r\n\
                   Content-Type: application/pidf+xml\r\n\
                   Content-Length: 6\r\n\
                   \r\n\
                   <pidf>";
        let message = parse_message(raw).unwrap();
        match message {
            Message::Request(r) => {
                assert_eq!(r.method, Method::Notify);
                assert_eq!(r.header("subscription-state"), Some("active;expires=600"));
                let body = r.body.unwrap();
                assert_eq!(body.content_type.as_str(), "application/pidf+xml");
                assert_eq!(body.as_bytes(), b"<pidf>");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn classifies_status_ranges() {
        assert!(Response::new(180, "Ringing").unwrap().is_provisional());
        assert!(Response::new(202, "Accepted").unwrap().is_success());
        assert!(!Response::new(412, "Conditional Request Failed").unwrap().is_success());
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(parse_message("FOO sip:a@b SIP/2.0\r\n\r\n").is_err());
    }
}
