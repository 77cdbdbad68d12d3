//! Host name -> routing identifier

/// Derives a routing identifier from the first label of a host name
///
/// `foo-hexrelay.example.com:8080` resolves to `foo` with suffix `-hexrelay`.
/// Hosts with fewer than three labels never resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdomainResolver {
    suffix: Option<String>,
}

impl SubdomainResolver {
    /// Resolver requiring the first label to end with `suffix`
    ///
    /// An empty suffix behaves like [`SubdomainResolver::without_suffix`].
    pub fn new(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self {
            suffix: if suffix.is_empty() { None } else { Some(suffix) },
        }
    }

    /// Resolver using the whole first label as identifier
    pub fn without_suffix() -> Self {
        Self { suffix: None }
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Resolve `host` (optionally with a `:port`) to an identifier
    pub fn resolve<'a>(&self, host: &'a str) -> Option<&'a str> {
        let host = strip_port(host);

        let mut labels = host.split('.');
        let first = labels.next()?;
        // Need at least two more labels after the first
        if labels.take(2).count() < 2 {
            return None;
        }

        let identifier = match &self.suffix {
            Some(suffix) => first.strip_suffix(suffix.as_str())?,
            None => first,
        };

        if identifier.is_empty() {
            None
        } else {
            Some(identifier)
        }
    }

    /// Public host name an identifier is reachable under, given the relay domain
    pub fn public_host(&self, identifier: &str, domain: &str) -> String {
        format!(
            "{}{}.{}",
            identifier,
            self.suffix.as_deref().unwrap_or(""),
            domain
        )
    }
}

/// Drop everything from the first colon on
fn strip_port(host: &str) -> &str {
    match host.find(':') {
        Some(i) => &host[..i],
        None => host,
    }
}
