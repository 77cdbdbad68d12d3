//! Agent configuration

use hexrelay_proto::{HOST_QUERY_PARAM, REGISTER_PATH};
use hexrelay_router::SubdomainResolver;
use std::time::Duration;
use url::Url;

/// Default keepalive ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Tunnel agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay control endpoint base, e.g. `ws://relay.example.com:8888` or
    /// `wss://relay.example.com`
    pub relay_url: String,

    /// Agent credential
    pub token: String,

    /// Routing identifier to claim; the token is used when absent
    pub identifier: Option<String>,

    /// Local service every stream is connected to
    pub local_addr: String,

    pub ping_interval: Duration,

    /// Relay's public domain, only used to log the public URL
    pub public_domain: Option<String>,

    /// Subdomain suffix the relay expects
    pub suffix: String,

    /// Accept any certificate from a `wss://` relay
    pub insecure: bool,
}

impl AgentConfig {
    pub fn new(
        relay_url: impl Into<String>,
        token: impl Into<String>,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            token: token.into(),
            identifier: None,
            local_addr: local_addr.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            public_domain: None,
            suffix: "-hexrelay".to_string(),
            insecure: false,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_public_domain(mut self, domain: impl Into<String>) -> Self {
        self.public_domain = Some(domain.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Whether the relay URL asks for TLS
    pub fn uses_tls(&self) -> bool {
        self.relay_url
            .get(..6)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("wss://"))
    }

    /// Identifier the relay will route by
    pub fn effective_identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.token)
    }

    /// Full registration URL: `<relay_url>/register?host=<identifier>`
    pub fn registration_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.relay_url)?;
        url.set_path(REGISTER_PATH);
        url.query_pairs_mut()
            .clear()
            .append_pair(HOST_QUERY_PARAM, self.effective_identifier());
        Ok(url)
    }

    /// `http(s)://<identifier><suffix>.<domain>`, if a domain is configured
    pub fn public_url(&self) -> Option<String> {
        let domain = self.public_domain.as_deref()?;
        let host = SubdomainResolver::new(self.suffix.clone())
            .public_host(self.effective_identifier(), domain);
        let scheme = if self.uses_tls() { "https" } else { "http" };
        Some(format!("{}://{}", scheme, host))
    }
}
