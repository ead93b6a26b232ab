//! Cloud service-account credentials
//!
//! The credential is a base64 encoded JSON document (a GCP service-account
//! key). It is held in zeroizing memory and never printed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

use crate::Error;

/// A validated, base64 encoded service-account JSON blob
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    /// Validate a base64 encoded JSON credential.
    ///
    /// The value must decode with the standard alphabet, re-encode to the
    /// exact same text and decode to a JSON document.
    pub fn from_base64(encoded: impl Into<String>) -> Result<Self, Error> {
        let encoded = Zeroizing::new(encoded.into());
        if encoded.is_empty() {
            return Err(Error::validation_for_field("cloud_sa", "credential is empty"));
        }
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|_| Error::validation_for_field("cloud_sa", "not valid base64"))?,
        );
        if STANDARD.encode(decoded.as_slice()) != *encoded {
            return Err(Error::validation_for_field(
                "cloud_sa",
                "base64 inconsistency",
            ));
        }
        serde_json::from_slice::<serde_json::Value>(&decoded)
            .map_err(|_| Error::validation_for_field("cloud_sa", "Couldn't find json data"))?;
        Ok(Self(encoded))
    }

    /// Validate raw JSON credentials and encode them
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        serde_json::from_str::<serde_json::Value>(raw)
            .map_err(|_| Error::validation_for_field("credentials", "Couldn't find json data"))?;
        Ok(Self(Zeroizing::new(STANDARD.encode(raw.as_bytes()))))
    }

    /// The base64 encoded credential
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(s: &str) -> String {
        STANDARD.encode(s.as_bytes())
    }

    #[test]
    fn test_valid_base64_json_is_accepted() {
        let encoded = encode(r#"{"key": "value1"}"#);
        let cred = Credential::from_base64(encoded.clone()).unwrap();
        assert_eq!(cred.expose(), encoded);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let err = Credential::from_base64("not*base64").unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[test]
    fn test_base64_without_json_is_rejected() {
        let err = Credential::from_base64(encode("plain text")).unwrap_err();
        assert!(err.to_string().contains("Couldn't find json data"));
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(Credential::from_base64("").is_err());
    }

    #[test]
    fn test_raw_json_is_encoded() {
        let cred = Credential::from_json(r#"{"type": "service_account"}"#).unwrap();
        assert_eq!(cred.expose(), encode(r#"{"type": "service_account"}"#));
        assert!(Credential::from_json("nope").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let cred = Credential::from_base64(encode(r#"{"secret": "shh"}"#)).unwrap();
        let printed = format!("{:?}", cred);
        assert!(!printed.contains(cred.expose()));
        assert!(printed.contains("redacted"));
    }
}
