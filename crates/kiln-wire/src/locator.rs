//! Service locator strings.
//!
//! A locator is `scheme:key=value,key=value`. The scheme names a transport
//! (`bind`, `tcp`); the options identify the endpoint within it. Option
//! order is preserved so locators compare the way they were written.

use crate::{WireError, WireResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLocator {
    original: String,
    scheme: String,
    options: Vec<(String, String)>,
}

impl ServiceLocator {
    pub fn parse(input: &str) -> WireResult<Self> {
        let (scheme, rest) = input
            .split_once(':')
            .ok_or_else(|| WireError::BadLocator(format!("missing scheme in {input:?}")))?;
        if scheme.is_empty() {
            return Err(WireError::BadLocator(format!("empty scheme in {input:?}")));
        }
        let mut options = Vec::new();
        if !rest.is_empty() {
            for pair in rest.split(',') {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    WireError::BadLocator(format!("option {pair:?} is not key=value"))
                })?;
                if key.is_empty() {
                    return Err(WireError::BadLocator(format!("empty key in {input:?}")));
                }
                options.push((key.to_string(), value.to_string()));
            }
        }
        Ok(ServiceLocator {
            original: input.to_string(),
            scheme: scheme.to_string(),
            options,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The locator exactly as it was parsed.
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl std::fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}
