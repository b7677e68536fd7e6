use std::time::Duration;

use reqwest::{Method, RequestBuilder};

use crate::error::Result;

pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
pub const CONNECT_PROTOCOL_HEADER: &str = "Connect-Protocol-Version";
pub const CONNECT_PROTOCOL_VERSION: &str = "1";

/// HTTP plumbing for the envd service running inside one sandbox.
///
/// Shared by the readiness prober, the process client and the filesystem
/// client so they all attach the same access token.
#[derive(Clone)]
pub struct EnvdTransport {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl EnvdTransport {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A request with the access token attached, when there is one.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.access_token {
            Some(token) => builder.header(ACCESS_TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// A unary Connect RPC call with a JSON body.
    pub fn rpc(&self, path: &str, body: &serde_json::Value) -> RequestBuilder {
        self.request(Method::POST, path)
            .header(CONNECT_PROTOCOL_HEADER, CONNECT_PROTOCOL_VERSION)
            .json(body)
    }
}
