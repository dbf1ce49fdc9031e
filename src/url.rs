//! Service address plus configuration parameters.
//!
//! A [`Url`] identifies a service endpoint (`protocol://host:port/path`) and
//! carries its configuration as an ordered parameter map. Rendering is
//! deterministic so two equal configurations render to the same string.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Result, RpcError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    protocol: String,
    host: Option<String>,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

impl Url {
    pub fn new(protocol: &str, host: Option<&str>, port: u16, path: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.filter(|h| !h.is_empty()).map(str::to_string),
            port,
            path: path.trim_start_matches('/').to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Parse `protocol://host:port/path?k=v&…`.
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = ::url::Url::parse(input)
            .map_err(|e| RpcError::IllegalState(format!("invalid url {}: {}", input, e)))?;
        let mut result = Url::new(
            parsed.scheme(),
            parsed.host_str(),
            parsed.port().unwrap_or(0),
            parsed.path(),
        );
        for (k, v) in parsed.query_pairs() {
            result.params.insert(k.into_owned(), v.into_owned());
        }
        Ok(result)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// `host:port`, used as the channel pool key.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or(""), self.port)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.param(key) {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_params<'a, I>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in params {
            self.params.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn without_param(mut self, key: &str) -> Self {
        self.params.remove(key);
        self
    }

    pub fn with_host(mut self, host: Option<&str>) -> Self {
        self.host = host.filter(|h| !h.is_empty()).map(str::to_string);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.trim_start_matches('/').to_string();
        self
    }

    /// Same url with the parameter map replaced.
    pub fn with_all_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Stable content hash of the rendered url.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(host) = &self.host {
            f.write_str(host)?;
            if self.port > 0 {
                write!(f, ":{}", self.port)?;
            }
        }
        write!(f, "/{}", self.path)?;
        let mut sep = '?';
        for (k, v) in &self.params {
            write!(f, "{}{}={}", sep, k, v)?;
            sep = '&';
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let url = Url::parse("joy://10.0.0.1:22000/demo.Echo?timeout=500&alias=blue").unwrap();
        assert_eq!(url.protocol(), "joy");
        assert_eq!(url.host(), Some("10.0.0.1"));
        assert_eq!(url.port(), 22000);
        assert_eq!(url.path(), "demo.Echo");
        assert_eq!(url.get_u64("timeout", 0), 500);
        assert_eq!(url.address(), "10.0.0.1:22000");
        // keys render sorted
        assert_eq!(
            url.to_string(),
            "joy://10.0.0.1:22000/demo.Echo?alias=blue&timeout=500"
        );
    }

    #[test]
    fn test_without_host_is_host_independent() {
        let a = Url::parse("joy://10.0.0.1:22000/demo.Echo?alias=x").unwrap();
        let b = Url::parse("joy://10.0.0.2:22000/demo.Echo?alias=x").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.with_host(None), b.with_host(None));
    }

    #[test]
    fn test_params() {
        let url = Url::new("joy", None, 0, "/svc")
            .with_param("register", false)
            .with_param("weight", 7);
        assert!(!url.get_bool("register", true));
        assert!(url.get_bool("subscribe", true));
        assert_eq!(url.get_str("weight", "0"), "7");
        assert_eq!(url.to_string(), "joy:///svc?register=false&weight=7");
        assert!(url.without_param("weight").param("weight").is_none());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Url::new("joy", None, 0, "svc").with_param("alias", "a");
        let b = Url::new("joy", None, 0, "svc").with_param("alias", "a");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), b.with_param("alias", "b").content_hash());
    }

    #[test]
    fn test_invalid() {
        assert!(Url::parse("not a url").is_err());
    }
}
