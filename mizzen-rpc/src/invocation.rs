//! Invocation and result values

use mizzen_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One method call travelling through the invocation pipeline.
///
/// Arguments are carried pre-serialized so the pipeline stays agnostic of
/// user types; the proxy layer encodes and decodes them at the edges.
/// Attachments are caller metadata forwarded with exactly this call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RpcInvocation {
    method: String,
    arguments: Vec<Vec<u8>>,
    attachments: BTreeMap<String, String>,
}

impl RpcInvocation {
    pub fn new(method: &str) -> Self {
        Self { method: method.to_string(), ..Default::default() }
    }

    pub fn with_arguments(mut self, arguments: Vec<Vec<u8>>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_attachment(mut self, key: &str, value: impl ToString) -> Self {
        self.attachments.insert(key.to_string(), value.to_string());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arguments(&self) -> &[Vec<u8>] {
        &self.arguments
    }

    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(|s| s.as_str())
    }

    pub fn set_attachment(&mut self, key: &str, value: impl ToString) {
        self.attachments.insert(key.to_string(), value.to_string());
    }

    pub fn set_attachment_if_absent(&mut self, key: &str, value: impl ToString) {
        self.attachments
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    pub fn remove_attachment(&mut self, key: &str) {
        self.attachments.remove(key);
    }
}

/// Outcome of an invocation: exactly one of value or exception is set.
///
/// Framework failures (timeouts, lost connections, routing dead ends) are
/// `Err` at the invoker boundary instead; an exception here always came from
/// the remote service implementation.
#[derive(Debug, Clone, Default)]
pub struct RpcResult {
    value: Option<Vec<u8>>,
    exception: Option<Error>,
    attachments: BTreeMap<String, String>,
}

impl RpcResult {
    /// Successful result carrying a serialized return value
    pub fn value(value: Vec<u8>) -> Self {
        Self { value: Some(value), ..Default::default() }
    }

    /// Successful result of a method returning nothing
    pub fn null() -> Self {
        Self::default()
    }

    /// Result carrying a service-raised exception
    pub fn exception(error: Error) -> Self {
        Self { value: None, exception: Some(error), attachments: BTreeMap::new() }
    }

    pub fn with_attachments(mut self, attachments: BTreeMap<String, String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn get_value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn get_exception(&self) -> Option<&Error> {
        self.exception.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(|s| s.as_str())
    }

    pub fn set_attachment(&mut self, key: &str, value: impl ToString) {
        self.attachments.insert(key.to_string(), value.to_string());
    }

    /// Collapse into the caller-facing result: the exception, if any,
    /// becomes the error
    pub fn recreate(self) -> Result<Option<Vec<u8>>> {
        match self.exception {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_and_exception_are_exclusive() {
        let ok = RpcResult::value(vec![1, 2]);
        assert!(!ok.has_exception());
        assert_eq!(ok.get_value(), Some(&[1u8, 2u8][..]));

        let bad = RpcResult::exception(Error::biz("boom"));
        assert!(bad.has_exception());
        assert!(bad.get_value().is_none());
    }

    #[test]
    fn recreate_surfaces_exception() {
        assert!(RpcResult::value(vec![1]).recreate().is_ok());
        assert!(RpcResult::null().recreate().unwrap().is_none());
        assert!(RpcResult::exception(Error::biz("boom")).recreate().is_err());
    }

    #[test]
    fn attachments_do_not_leak_between_clones() {
        let invocation = RpcInvocation::new("greet").with_attachment("a", "1");
        let mut clone = invocation.clone();
        clone.set_attachment("b", "2");
        assert!(invocation.attachment("b").is_none());
        assert_eq!(clone.attachment("a"), Some("1"));
    }
}
