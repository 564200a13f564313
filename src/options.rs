//! Connect and listen configuration.
//!
//! Provides typed options for outbound clients ([`ConnectOptions`]) and
//! listeners ([`ListenOptions`]), plus loaders for untyped JSON input that
//! check the shape of every recognized key before deserializing.
//!
//! # Example
//!
//! ```ignore
//! use sockwrap::{ConnectOptions, ListenOptions};
//!
//! let connect = ConnectOptions::new(8080).with_host("example.com");
//!
//! let listen = ListenOptions::from_json(r#"{ "host": "::", "port": 0, "ipv6Only": true }"#)?;
//! assert!(!listen.is_secure());
//! ```
//!
//! # Recognized Keys
//!
//! | Key | Type | Default | Side |
//! |-----|------|---------|------|
//! | `host` | string or null | none | both |
//! | `port` | number | required | both |
//! | `secure` | boolean or null | `false` | client |
//! | `rejectUnauthorized` | boolean or null | `true` | both |
//! | `requestCert` | boolean or null | `false` | listener |
//! | `ipv6Only` | boolean or null | `false` | listener |
//! | `cert`, `key`, `ca` | string, byte array or null | none | both |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Host used by outbound clients when none is configured.
pub const DEFAULT_CONNECT_HOST: &str = "localhost";

/// Host used by listeners when none is configured.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Host used by IPv6-only listeners when none is configured.
pub const DEFAULT_LISTEN_HOST_V6: &str = "::";

// ============================================================================
// Pem
// ============================================================================

/// Certificate, key or CA material.
///
/// Either PEM text or raw bytes, kept exactly as supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pem {
    /// Text material (usually PEM).
    Text(String),
    /// Raw bytes (PEM or DER).
    Bytes(Vec<u8>),
}

impl Pem {
    /// Returns the material as bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for Pem {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Pem {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Pem {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Pem {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

// ============================================================================
// ConnectOptions
// ============================================================================

/// Options for an outbound client connection.
///
/// Immutable once handed to a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Remote host name. Defaults to [`DEFAULT_CONNECT_HOST`].
    #[serde(default)]
    pub host: Option<String>,

    /// Remote port.
    pub port: u16,

    /// Connect over a secure transport.
    #[serde(default)]
    pub secure: bool,

    /// Reject peers whose certificate does not validate.
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,

    /// Client certificate.
    #[serde(default)]
    pub cert: Option<Pem>,

    /// Private key for `cert`.
    #[serde(default)]
    pub key: Option<Pem>,

    /// CA used to validate a self-signed peer certificate.
    #[serde(default)]
    pub ca: Option<Pem>,
}

impl ConnectOptions {
    /// Creates options for `port` with every other key at its default.
    #[inline]
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            host: None,
            port,
            secure: false,
            reject_unauthorized: true,
            cert: None,
            key: None,
            ca: None,
        }
    }

    /// Sets the remote host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Requests a secure transport.
    #[inline]
    #[must_use]
    pub fn with_secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Sets whether unverifiable peers are rejected.
    #[inline]
    #[must_use]
    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// Sets the client certificate and its key.
    #[inline]
    #[must_use]
    pub fn with_identity(mut self, cert: impl Into<Pem>, key: impl Into<Pem>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    /// Sets the CA material.
    #[inline]
    #[must_use]
    pub fn with_ca(mut self, ca: impl Into<Pem>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    /// Returns the configured host or [`DEFAULT_CONNECT_HOST`].
    #[inline]
    #[must_use]
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_CONNECT_HOST)
    }

    /// Validates the options configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `cert` and `key` are not set together.
    pub fn validate(&self) -> Result<()> {
        validate_identity(self.cert.as_ref(), self.key.as_ref())
    }

    /// Builds options from untyped JSON, checking every recognized key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = require_object(value)?;

        check_host(object)?;
        check_port(object)?;
        check_flag(object, "secure")?;
        check_flag(object, "rejectUnauthorized")?;
        check_pem(object, "cert")?;
        check_pem(object, "key")?;
        check_pem(object, "ca")?;

        let options: Self = serde_json::from_value(without_nulls(object))
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Parses JSON text and builds options from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed text, otherwise as [`Self::from_value`].
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }
}

// ============================================================================
// ListenOptions
// ============================================================================

/// Options for a listener.
///
/// A listener is secure iff `cert` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenOptions {
    /// Bind address. Defaults to the unspecified address.
    #[serde(default)]
    pub host: Option<String>,

    /// Bind port; `0` lets the OS pick one.
    pub port: u16,

    /// Accept IPv6 connections only.
    #[serde(default)]
    pub ipv6_only: bool,

    /// Reject clients whose requested certificate does not validate.
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,

    /// Ask connecting clients for a certificate.
    #[serde(default)]
    pub request_cert: bool,

    /// Server certificate. Makes the listener secure.
    #[serde(default)]
    pub cert: Option<Pem>,

    /// Private key for `cert`.
    #[serde(default)]
    pub key: Option<Pem>,

    /// CA used to validate self-signed client certificates.
    #[serde(default)]
    pub ca: Option<Pem>,
}

impl ListenOptions {
    /// Creates options for `port` with every other key at its default.
    #[inline]
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            host: None,
            port,
            ipv6_only: false,
            reject_unauthorized: true,
            request_cert: false,
            cert: None,
            key: None,
            ca: None,
        }
    }

    /// Sets the bind host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Restricts the listener to IPv6.
    #[inline]
    #[must_use]
    pub fn with_ipv6_only(mut self) -> Self {
        self.ipv6_only = true;
        self
    }

    /// Sets whether unverifiable clients are rejected.
    #[inline]
    #[must_use]
    pub fn with_reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// Requests client certificates.
    #[inline]
    #[must_use]
    pub fn with_request_cert(mut self) -> Self {
        self.request_cert = true;
        self
    }

    /// Sets the server certificate and key.
    #[inline]
    #[must_use]
    pub fn with_identity(mut self, cert: impl Into<Pem>, key: impl Into<Pem>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    /// Sets the CA material.
    #[inline]
    #[must_use]
    pub fn with_ca(mut self, ca: impl Into<Pem>) -> Self {
        self.ca = Some(ca.into());
        self
    }

    /// Returns `true` if certificate material makes this listener secure.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.cert.is_some()
    }

    /// Returns the configured host or the matching unspecified address.
    #[inline]
    #[must_use]
    pub fn host_or_default(&self) -> &str {
        match (&self.host, self.ipv6_only) {
            (Some(host), _) => host.as_str(),
            (None, true) => DEFAULT_LISTEN_HOST_V6,
            (None, false) => DEFAULT_LISTEN_HOST,
        }
    }

    /// Validates the options configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `cert` and `key` are not set together.
    pub fn validate(&self) -> Result<()> {
        validate_identity(self.cert.as_ref(), self.key.as_ref())
    }

    /// Builds options from untyped JSON, checking every recognized key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = require_object(value)?;

        check_host(object)?;
        check_port(object)?;
        check_flag(object, "ipv6Only")?;
        check_flag(object, "rejectUnauthorized")?;
        check_flag(object, "requestCert")?;
        check_pem(object, "cert")?;
        check_pem(object, "key")?;
        check_pem(object, "ca")?;

        let options: Self = serde_json::from_value(without_nulls(object))
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Parses JSON text and builds options from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed text, otherwise as [`Self::from_value`].
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }
}

// ============================================================================
// Shape Checks
// ============================================================================

#[inline]
const fn default_true() -> bool {
    true
}

fn require_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::invalid_config("Bad options"))
}

/// Returns the value of `key` unless it is missing or null.
fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

fn check_host(object: &Map<String, Value>) -> Result<()> {
    match present(object, "host") {
        Some(host) if !host.is_string() => Err(Error::invalid_config("host must be null or string")),
        _ => Ok(()),
    }
}

fn check_port(object: &Map<String, Value>) -> Result<()> {
    let Some(port) = object.get("port").filter(|port| port.is_number()) else {
        return Err(Error::invalid_config("port must be a number"));
    };

    match port.as_u64() {
        Some(port) if port <= u64::from(u16::MAX) => Ok(()),
        _ => Err(Error::invalid_config(
            "port must be an integer between 0 and 65535",
        )),
    }
}

fn check_flag(object: &Map<String, Value>, key: &str) -> Result<()> {
    match present(object, key) {
        Some(flag) if !flag.is_boolean() => Err(Error::invalid_config(format!(
            "{key} must be null or boolean"
        ))),
        _ => Ok(()),
    }
}

fn check_pem(object: &Map<String, Value>, key: &str) -> Result<()> {
    let Some(value) = present(object, key) else {
        return Ok(());
    };

    let is_bytes = value.as_array().is_some_and(|items| {
        items
            .iter()
            .all(|item| item.as_u64().is_some_and(|byte| byte <= u64::from(u8::MAX)))
    });

    if value.is_string() || is_bytes {
        Ok(())
    } else {
        Err(Error::invalid_config(format!(
            "{key} must be null, string or bytes"
        )))
    }
}

/// Copies `object` without null entries so serde defaults apply.
fn without_nulls(object: &Map<String, Value>) -> Value {
    Value::Object(
        object
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

fn validate_identity(cert: Option<&Pem>, key: Option<&Pem>) -> Result<()> {
    match (cert, key) {
        (Some(_), None) => Err(Error::invalid_config("key is required when cert is set")),
        (None, Some(_)) => Err(Error::invalid_config("cert is required when key is set")),
        _ => Ok(()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn config_message(err: Error) -> String {
        match err {
            Error::InvalidConfig { message } => message,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_defaults() {
        let options = ConnectOptions::new(99);
        assert_eq!(options.port, 99);
        assert!(options.host.is_none());
        assert!(!options.secure);
        assert!(options.reject_unauthorized);
        assert_eq!(options.host_or_default(), DEFAULT_CONNECT_HOST);
    }

    #[test]
    fn test_connect_builder_chain() {
        let options = ConnectOptions::new(443)
            .with_host("host.com")
            .with_secure()
            .with_reject_unauthorized(false)
            .with_identity("mycert", "mykey")
            .with_ca(b"myca".as_slice());

        assert_eq!(options.host_or_default(), "host.com");
        assert!(options.secure);
        assert!(!options.reject_unauthorized);
        assert_eq!(options.ca, Some(Pem::Bytes(b"myca".to_vec())));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_connect_from_value_all_options() {
        let options = ConnectOptions::from_value(&json!({
            "host": "host.com",
            "port": 99,
            "secure": true,
            "rejectUnauthorized": null,
            "cert": "mycert",
            "key": [107, 101, 121],
            "ca": "myca",
        }))
        .expect("valid options");

        assert_eq!(options.host.as_deref(), Some("host.com"));
        assert_eq!(options.port, 99);
        assert!(options.secure);
        assert!(options.reject_unauthorized);
        assert_eq!(options.key, Some(Pem::Bytes(b"key".to_vec())));
    }

    #[test]
    fn test_from_value_rejects_missing_port() {
        let err = ConnectOptions::from_value(&json!({ "nodata": null })).unwrap_err();
        assert_eq!(config_message(err), "port must be a number");
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        let err = ConnectOptions::from_value(&Value::Null).unwrap_err();
        assert_eq!(config_message(err), "Bad options");
    }

    #[test]
    fn test_from_value_rejects_bad_host() {
        let err = ConnectOptions::from_value(&json!({ "host": 12, "port": 1 })).unwrap_err();
        assert_eq!(config_message(err), "host must be null or string");
    }

    #[test]
    fn test_from_value_rejects_string_port() {
        let err = ListenOptions::from_value(&json!({ "port": "80" })).unwrap_err();
        assert_eq!(config_message(err), "port must be a number");
    }

    #[test]
    fn test_from_value_rejects_port_out_of_range() {
        let err = ListenOptions::from_value(&json!({ "port": 70000 })).unwrap_err();
        assert!(config_message(err).contains("65535"));
    }

    #[test]
    fn test_from_value_rejects_non_boolean_flag() {
        let err = ConnectOptions::from_value(&json!({ "port": 1, "secure": "yes" })).unwrap_err();
        assert_eq!(config_message(err), "secure must be null or boolean");

        let err = ListenOptions::from_value(&json!({ "port": 1, "ipv6Only": 1 })).unwrap_err();
        assert_eq!(config_message(err), "ipv6Only must be null or boolean");
    }

    #[test]
    fn test_from_value_rejects_bad_pem() {
        let err = ListenOptions::from_value(&json!({ "port": 1, "ca": { "a": 1 } })).unwrap_err();
        assert_eq!(config_message(err), "ca must be null, string or bytes");

        let err = ListenOptions::from_value(&json!({ "port": 1, "ca": [1, 300] })).unwrap_err();
        assert_eq!(config_message(err), "ca must be null, string or bytes");
    }

    #[test]
    fn test_listen_from_json_all_options() {
        let options = ListenOptions::from_json(
            r#"{
                "host": "host.com",
                "port": 99,
                "ipv6Only": false,
                "rejectUnauthorized": null,
                "requestCert": true,
                "cert": "mycert",
                "key": "mykey",
                "ca": "myca"
            }"#,
        )
        .expect("valid options");

        assert_eq!(options.host.as_deref(), Some("host.com"));
        assert_eq!(options.port, 99);
        assert!(!options.ipv6_only);
        assert!(options.reject_unauthorized);
        assert!(options.request_cert);
        assert_eq!(options.cert, Some(Pem::from("mycert")));
        assert!(options.is_secure());
    }

    #[test]
    fn test_listen_from_json_malformed() {
        let err = ListenOptions::from_json("{ port").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_listen_host_defaults() {
        assert_eq!(ListenOptions::new(0).host_or_default(), DEFAULT_LISTEN_HOST);
        assert_eq!(
            ListenOptions::new(0).with_ipv6_only().host_or_default(),
            DEFAULT_LISTEN_HOST_V6
        );
        assert_eq!(
            ListenOptions::new(0).with_host("127.0.0.1").host_or_default(),
            "127.0.0.1"
        );
    }

    #[test]
    fn test_validate_identity_pairs() {
        let mut options = ListenOptions::new(0);
        options.cert = Some(Pem::from("cert"));
        assert!(options.validate().is_err());

        let mut options = ConnectOptions::new(1);
        options.key = Some(Pem::from("key"));
        assert!(options.validate().is_err());

        assert!(ListenOptions::new(0).with_identity("c", "k").validate().is_ok());
    }

    #[test]
    fn test_pem_as_bytes() {
        assert_eq!(Pem::from("abc").as_bytes(), b"abc");
        assert_eq!(Pem::from(vec![1u8, 2]).as_bytes(), &[1, 2]);
    }
}
