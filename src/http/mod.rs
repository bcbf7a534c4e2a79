use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Uri};

mod h2;

pub const ALPN_HTTP1: &str = "http/1.1";
pub const ALPN_HTTP2: &str = "h2";

/// Prebuilt request bytes for one target, cached per ALPN protocol.
///
/// The HTTP/1.1 form pipelines `requests` serialized requests on one
/// connection; the HTTP/2 form opens one stream per request after the
/// client preface.
pub struct HttpPayload {
    method: Method,
    uri: Uri,
    user_agent: String,
    requests: u32,
    h1: OnceLock<Bytes>,
    h2: OnceLock<Bytes>,
}

impl HttpPayload {
    pub fn new(method: Method, uri: Uri, user_agent: impl Into<String>, requests: u32) -> Self {
        Self {
            method,
            uri,
            user_agent: user_agent.into(),
            requests,
            h1: OnceLock::new(),
            h2: OnceLock::new(),
        }
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    /// The payload for a negotiated protocol; `None` for an unknown ALPN.
    pub fn payload(&self, alpn: &str) -> Option<Bytes> {
        match alpn {
            ALPN_HTTP1 => Some(self.h1.get_or_init(|| self.build_h1()).clone()),
            ALPN_HTTP2 => Some(self.h2.get_or_init(|| self.build_h2()).clone()),
            _ => {
                log::warn!("unknown alpn: {alpn}");
                None
            }
        }
    }

    fn build_h1(&self) -> Bytes {
        let path = self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let host = host_header(&self.uri);
        let mut buf = BytesMut::new();
        for i in 0..self.requests {
            let connection = if i + 1 == self.requests { "close" } else { "keep-alive" };
            buf.put_slice(
                format!(
                    "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: {}\r\n\r\n",
                    self.method, path, host, self.user_agent, connection
                )
                .as_bytes(),
            );
        }
        buf.freeze()
    }

    fn build_h2(&self) -> Bytes {
        h2::build_payload(&self.method, &self.uri, &self.user_agent, self.requests)
    }
}

/// `host[:port]`, omitting the scheme's default port.
pub(crate) fn host_header(uri: &Uri) -> String {
    let host = uri.host().unwrap_or_default();
    match (uri.port_u16(), uri.scheme_str()) {
        (Some(443), Some("https")) | (Some(80), Some("http")) | (None, _) => host.to_string(),
        (Some(p), _) => format!("{host}:{p}"),
    }
}
