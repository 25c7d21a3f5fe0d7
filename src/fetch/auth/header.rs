use crate::error::{PipelineError, Result};
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects credentials as HTTP headers.
///
/// Header names and values are validated when added, so `execute` never
/// fails on them.
pub struct HeaderAuth<C> {
    inner: C,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl<C> HeaderAuth<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PipelineError::Config(format!("invalid header name {name}: {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| PipelineError::Config(format!("invalid value for header {name}: {e}")))?;
        value.set_sensitive(true);
        self.headers.push((name, value));
        Ok(self)
    }

    /// ClickHouse user/password headers.
    pub fn clickhouse(inner: C, user: &str, password: &str) -> Result<Self> {
        Self::new(inner)
            .with_header("X-ClickHouse-User", user)?
            .with_header("X-ClickHouse-Key", password)
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for HeaderAuth<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unused;

    #[async_trait]
    impl HttpClient for Unused {
        async fn execute(&self, _req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
            unreachable!()
        }
    }

    #[test]
    fn test_invalid_header_is_a_config_error() {
        assert!(matches!(
            HeaderAuth::new(Unused).with_header("bad header", "v"),
            Err(PipelineError::Config(_))
        ));
        assert!(HeaderAuth::clickhouse(Unused, "default", "secret").is_ok());
    }
}
