use crate::error::{Error, Result};
use dtls::crypto::{CryptoPrivateKey, CryptoPrivateKeyKind};
use rand::thread_rng;
use rand::Rng;
use rcgen::CertificateParams;
use ring::rand::SystemRandom;
use ring::rsa;
use ring::signature::{EcdsaKeyPair, Ed25519KeyPair};
use sha2::{Digest, Sha256};
use std::ops::Add;
use std::time::{Duration, SystemTime};

/// DTLSFingerprint specifies the hash function algorithm and certificate
/// fingerprint as described in <https://tools.ietf.org/html/rfc4572>.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct RTCDtlsFingerprint {
    /// Algorithm specifies one of the the hash function algorithms defined in
    /// the 'Hash function Textual Names' registry.
    pub algorithm: String,

    /// Value specifies the value of the certificate fingerprint in lowercase
    /// hex string as expressed utilizing the syntax of 'fingerprint' in
    /// <https://tools.ietf.org/html/rfc4572#section-5>.
    pub value: String,
}

impl TryFrom<&str> for RTCDtlsFingerprint {
    type Error = Error;

    /// parses the value of an `a=fingerprint` attribute, e.g. `sha-256 AB:CD:...`
    fn try_from(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(' ').collect();
        if parts.len() != 2 {
            return Err(Error::negotiation_failed(format!(
                "invalid fingerprint attribute '{value}'"
            )));
        }

        let digest = hex::decode(parts[1].replace(':', "")).map_err(|err| {
            Error::negotiation_failed(format!("invalid fingerprint value: {err}"))
        })?;
        if digest.is_empty() {
            return Err(Error::negotiation_failed("empty fingerprint value"));
        }

        Ok(Self {
            algorithm: parts[0].to_lowercase(),
            value: parts[1].to_lowercase(),
        })
    }
}

impl RTCDtlsFingerprint {
    /// the SHA-256 fingerprint of a DER encoded certificate
    pub fn sha256(der: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(der);
        let hashed = h.finalize();
        let values: Vec<String> = hashed.iter().map(|x| format! {"{x:02x}"}).collect();

        Self {
            algorithm: "sha-256".to_owned(),
            value: values.join(":"),
        }
    }

    /// matches checks a certificate the peer presented during the DTLS handshake
    /// against this advertised fingerprint
    pub fn matches(&self, der: &[u8]) -> Result<()> {
        if self.algorithm != "sha-256" {
            return Err(Error::negotiation_failed(format!(
                "unsupported fingerprint algorithm '{}'",
                self.algorithm
            )));
        }
        if Self::sha256(der).value == self.value {
            Ok(())
        } else {
            Err(Error::negotiation_failed(
                "peer certificate does not match the advertised fingerprint",
            ))
        }
    }
}

/// Certificate represents a X.509 certificate used to authenticate the DTLS
/// handshake of an endpoint; its fingerprint is carried in every session description.
#[derive(Clone, Debug)]
pub struct RTCCertificate {
    /// DTLS certificate.
    pub dtls_certificate: dtls::crypto::Certificate,
    /// Timestamp after which this certificate is no longer valid.
    pub expires: SystemTime,
}

impl PartialEq for RTCCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.dtls_certificate == other.dtls_certificate
    }
}

impl RTCCertificate {
    /// Generates a new certificate from the given parameters.
    ///
    /// See [`rcgen::Certificate::from_params`].
    pub fn from_params(params: CertificateParams) -> Result<Self> {
        let not_after: SystemTime = params.not_after.into();
        let x509_cert = rcgen::Certificate::from_params(params)
            .map_err(|err| Error::Certificate(err.to_string()))?;

        let key_pair = x509_cert.get_key_pair();
        let serialized_der = key_pair.serialize_der();

        let private_key = if key_pair.is_compatible(&rcgen::PKCS_ED25519) {
            CryptoPrivateKey {
                kind: CryptoPrivateKeyKind::Ed25519(
                    Ed25519KeyPair::from_pkcs8(&serialized_der)
                        .map_err(|e| Error::Certificate(e.to_string()))?,
                ),
                serialized_der,
            }
        } else if key_pair.is_compatible(&rcgen::PKCS_ECDSA_P256_SHA256) {
            CryptoPrivateKey {
                kind: CryptoPrivateKeyKind::Ecdsa256(
                    EcdsaKeyPair::from_pkcs8(
                        &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                        &serialized_der,
                        &SystemRandom::new(),
                    )
                    .map_err(|e| Error::Certificate(e.to_string()))?,
                ),
                serialized_der,
            }
        } else if key_pair.is_compatible(&rcgen::PKCS_RSA_SHA256) {
            CryptoPrivateKey {
                kind: CryptoPrivateKeyKind::Rsa256(
                    rsa::KeyPair::from_pkcs8(&serialized_der)
                        .map_err(|e| Error::Certificate(e.to_string()))?,
                ),
                serialized_der,
            }
        } else {
            return Err(Error::Certificate("unsupported key pair".to_owned()));
        };

        let certificate = x509_cert
            .serialize_der()
            .map_err(|err| Error::Certificate(err.to_string()))?;

        let expires = if cfg!(target_arch = "arm") {
            // Workaround for issue overflow when adding duration to instant on armv7
            // https://github.com/webrtc-rs/examples/issues/5 https://github.com/chronotope/chrono/issues/343
            SystemTime::now().add(Duration::from_secs(172800)) //60*60*48 or 2 days
        } else {
            not_after
        };

        Ok(Self {
            dtls_certificate: dtls::crypto::Certificate {
                certificate: vec![rustls::Certificate(certificate)],
                private_key,
            },
            expires,
        })
    }

    /// Generates a new ECDSA P-256 certificate with a random common name.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(vec![math_rand_alpha(16)]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        RTCCertificate::from_params(params)
    }

    /// get_fingerprints returns a SHA-256 fingerprint of this certificate.
    pub fn get_fingerprints(&self) -> Vec<RTCDtlsFingerprint> {
        self.dtls_certificate
            .certificate
            .iter()
            .map(|c| RTCDtlsFingerprint::sha256(c.as_ref()))
            .collect()
    }
}

const RUNES_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// math_rand_alpha generates a mathematical random alphabet sequence of the requested length.
pub(crate) fn math_rand_alpha(n: usize) -> String {
    let mut rng = thread_rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.gen_range(0..RUNES_ALPHA.len());
            RUNES_ALPHA[idx] as char
        })
        .collect();

    rand_string
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_certificate_fingerprint() -> Result<()> {
        let certificate = RTCCertificate::generate()?;
        let fingerprints = certificate.get_fingerprints();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].algorithm, "sha-256");
        // 32 bytes as colon separated hex pairs
        assert_eq!(fingerprints[0].value.len(), 32 * 3 - 1);

        let parsed = RTCDtlsFingerprint::try_from(
            format!(
                "{} {}",
                fingerprints[0].algorithm,
                fingerprints[0].value.to_uppercase()
            )
            .as_str(),
        )?;
        assert_eq!(parsed, fingerprints[0]);
        Ok(())
    }

    #[test]
    fn test_fingerprint_matches_only_its_certificate() -> Result<()> {
        let certificate = RTCCertificate::generate()?;
        let other = RTCCertificate::generate()?;
        let fingerprint = &certificate.get_fingerprints()[0];

        fingerprint.matches(certificate.dtls_certificate.certificate[0].as_ref())?;
        assert!(matches!(
            fingerprint.matches(other.dtls_certificate.certificate[0].as_ref()),
            Err(Error::NegotiationFailed(_))
        ));

        let unsupported = RTCDtlsFingerprint {
            algorithm: "sha-1".to_owned(),
            value: fingerprint.value.clone(),
        };
        assert!(unsupported
            .matches(certificate.dtls_certificate.certificate[0].as_ref())
            .is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_fingerprint() {
        assert!(RTCDtlsFingerprint::try_from("sha-256").is_err());
        assert!(RTCDtlsFingerprint::try_from("sha-256 ZZ:01").is_err());
        assert!(RTCDtlsFingerprint::try_from("sha-256 ").is_err());
    }

    #[test]
    fn test_math_rand_alpha() {
        let s = math_rand_alpha(16);
        assert_eq!(s.len(), 16);
        assert!(s.bytes().all(|b| RUNES_ALPHA.contains(&b)));
    }
}
