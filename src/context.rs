use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

use crate::identity::Identity;

/// State of one inbound request. Owned by the flow that created it and
/// dropped once the response is produced.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub identity: Option<Identity>,
    pub upstream_service: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            identity: None,
            upstream_service: None,
            metadata: HashMap::new(),
        }
    }

    pub fn original_path(&self) -> &str {
        self.uri.path()
    }
}
