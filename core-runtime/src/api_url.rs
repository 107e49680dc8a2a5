//! Resolution of API paths against the configured base URL.

use crate::error::{Error, Result};
use url::Url;

/// Base URL that endpoint paths (`adrive/v1.0/openFile/get`) are joined to.
#[derive(Debug, Clone)]
pub struct ApiBase {
    base: Url,
}

impl ApiBase {
    pub fn parse(base: &str) -> Result<Self> {
        let mut base =
            Url::parse(base).map_err(|e| Error::Config(format!("Invalid base API URL: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    /// Join a relative path to the base.
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    /// Join a path and append query parameters in order.
    pub fn url_with_query<'a, I>(&self, path: &str, query: I) -> Result<Url>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut url = self.url(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}
