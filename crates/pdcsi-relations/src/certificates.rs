//! Requires side of the `certificates` relation
//!
//! Only the CA is consumed. The provider publishes it PEM encoded under
//! `ca` in its unit databag.

use std::sync::Arc;

use tracing::warn;

use pdcsi_common::{Error, Readiness};

use crate::relation::RelationChannel;

/// Relation endpoint name
pub const ENDPOINT: &str = "certificates";

/// Check that `pem` holds a parseable X.509 certificate
pub fn validate_ca(pem: &str) -> Result<(), Error> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::validation_for_field("ca", format!("invalid PEM: {}", e)))?;
    parsed
        .parse_x509()
        .map_err(|e| Error::validation_for_field("ca", format!("invalid certificate: {}", e)))?;
    Ok(())
}

/// Client for the certificate authority
pub struct CertificatesRequires {
    channel: Arc<dyn RelationChannel>,
}

impl CertificatesRequires {
    /// Create a client over `channel`
    pub fn new(channel: Arc<dyn RelationChannel>) -> Self {
        Self { channel }
    }

    /// The CA certificate, once a valid one has been published
    pub fn ca(&self) -> Result<Option<String>, Error> {
        let Some(relation) = self.channel.relation(ENDPOINT)? else {
            return Ok(None);
        };
        let Some(ca) = relation
            .units
            .values()
            .find_map(|bag| bag.get("ca").filter(|ca| !ca.is_empty()))
        else {
            return Ok(None);
        };
        match validate_ca(ca) {
            Ok(()) => Ok(Some(ca.clone())),
            Err(e) => {
                warn!(error = %e, "{} relation published an unusable CA", ENDPOINT);
                Ok(None)
            }
        }
    }

    /// Gate verdict; `broken` is set when this relation is being removed
    pub fn evaluate(&self, broken: bool) -> Result<Readiness, Error> {
        if broken {
            return Ok(Readiness::relation_unready(ENDPOINT, false));
        }
        if self.ca()?.is_some() {
            return Ok(Readiness::Ready);
        }
        let present = self.channel.relation(ENDPOINT)?.is_some();
        Ok(Readiness::relation_unready(ENDPOINT, present))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::{databag, MemoryRelationChannel};

    const CA: &str = include_str!("../testdata/ca.crt");

    #[test]
    fn test_validate_ca() {
        assert!(validate_ca(CA).is_ok());
        assert!(validate_ca("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
        assert!(validate_ca("not a certificate").is_err());
    }

    #[test]
    fn test_verdicts_follow_relation_lifecycle() {
        let channel = Arc::new(MemoryRelationChannel::new());
        let certificates = CertificatesRequires::new(channel.clone());

        assert_eq!(
            certificates.evaluate(false).unwrap(),
            Readiness::Blocked("Missing required certificates".into())
        );

        channel.join(ENDPOINT);
        assert_eq!(
            certificates.evaluate(false).unwrap(),
            Readiness::Waiting("Waiting for certificates".into())
        );

        channel.set_remote(ENDPOINT, "easyrsa/0", databag([("ca", CA)]));
        assert_eq!(certificates.evaluate(false).unwrap(), Readiness::Ready);
        assert_eq!(certificates.ca().unwrap().as_deref(), Some(CA));

        assert_eq!(
            certificates.evaluate(true).unwrap(),
            Readiness::Blocked("Missing required certificates".into())
        );
    }

    #[test]
    fn test_garbage_ca_waits() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.set_remote(ENDPOINT, "easyrsa/0", databag([("ca", "garbage")]));
        let certificates = CertificatesRequires::new(channel);
        assert!(certificates.ca().unwrap().is_none());
        assert_eq!(
            certificates.evaluate(false).unwrap(),
            Readiness::Waiting("Waiting for certificates".into())
        );
    }
}
