//! C4: certificate authority. Loads (or generates) a CA keypair, signs
//! client CSRs, and presents the server's own leaf certificate for the mTLS
//! control listener.
//!
//! Grounded in the teacher's `network/transport/tls_tunnel.rs` (ECDSA P-256
//! key generation, SAN construction, validity window), generalized from a
//! single self-signed P2P certificate to a CA that signs third-party CSRs.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::error::{FatalStartupError, TransportAuthError};

const CLIENT_CERT_VALIDITY_DAYS: i64 = 365;

/// Output of a successful CSR signing: the signed client certificate and the
/// CA certificate the client needs to validate the server's own leaf cert.
pub struct SignedCertificate {
    pub client_cert_pem: String,
    pub ca_cert_pem: String,
}

/// Server-side TLS materials for the mTLS control listener: the server's own
/// leaf certificate (signed by this CA) and its private key, plus the CA
/// certificate so the listener can verify client certificates signed by it.
pub struct ServerCredentials {
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub ca_cert_pem: String,
}

/// Holds the CA's own keypair/certificate and a pre-issued server leaf
/// certificate used to terminate the mTLS control channel.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
}

impl CertificateAuthority {
    /// Generates a fresh CA keypair/certificate plus a server leaf
    /// certificate, persisting PEMs under `dir` (`ca.crt`, `ca.key`,
    /// `server.crt`, `server.key`). Used by `flcsd init`.
    pub fn generate(dir: &Path) -> Result<Self, FatalStartupError> {
        let ca_key = KeyPair::generate()
            .map_err(|e| FatalStartupError::CaLoad(format!("CA key generation: {e}")))?;

        let mut ca_params = CertificateParams::new(Vec::new())
            .map_err(|e| FatalStartupError::CaLoad(format!("CA params: {e}")))?;
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, "FLCS Coordination CA");
        ca_dn.push(DnType::OrganizationName, "FLCS");
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        ca_params.not_before = OffsetDateTime::now_utc();
        ca_params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(3650);

        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| FatalStartupError::CaLoad(format!("CA self-sign: {e}")))?;
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        let (server_cert_pem, server_key_pem) =
            Self::issue_leaf(&ca_cert, &ca_key, "localhost", &["localhost".to_string()])?;

        fs::create_dir_all(dir).map_err(|e| {
            FatalStartupError::CaLoad(format!("creating {}: {e}", dir.display()))
        })?;
        write_restricted(&dir.join("ca.crt"), ca_cert_pem.as_bytes())?;
        write_restricted(&dir.join("ca.key"), ca_key_pem.as_bytes())?;
        write_restricted(&dir.join("server.crt"), server_cert_pem.as_bytes())?;
        write_restricted(&dir.join("server.key"), server_key_pem.as_bytes())?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            server_cert_pem,
            server_key_pem,
        })
    }

    /// Loads a previously generated CA and server leaf certificate from
    /// `dir`. Fatal on any read/parse failure (spec §7 `FatalStartup`).
    pub fn load(dir: &Path) -> Result<Self, FatalStartupError> {
        let ca_cert_pem = read_to_string(&dir.join("ca.crt"))?;
        let ca_key_pem = read_to_string(&dir.join("ca.key"))?;
        let server_cert_pem = read_to_string(&dir.join("server.crt"))?;
        let server_key_pem = read_to_string(&dir.join("server.key"))?;

        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| FatalStartupError::CaLoad(format!("parsing ca.key: {e}")))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| FatalStartupError::CaLoad(format!("parsing ca.crt: {e}")))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| FatalStartupError::CaLoad(format!("re-deriving CA cert: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            server_cert_pem,
            server_key_pem,
        })
    }

    fn issue_leaf(
        ca_cert: &Certificate,
        ca_key: &KeyPair,
        common_name: &str,
        sans: &[String],
    ) -> Result<(String, String), FatalStartupError> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| FatalStartupError::CaLoad(format!("leaf key generation: {e}")))?;

        let mut params = CertificateParams::new(sans.to_vec())
            .map_err(|e| FatalStartupError::CaLoad(format!("leaf params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(CLIENT_CERT_VALIDITY_DAYS);

        let cert = params
            .signed_by(&leaf_key, ca_cert, ca_key)
            .map_err(|e| FatalStartupError::CaLoad(format!("signing server leaf: {e}")))?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }

    pub fn server_credentials(&self) -> ServerCredentials {
        ServerCredentials {
            server_cert_pem: self.server_cert_pem.clone(),
            server_key_pem: self.server_key_pem.clone(),
            ca_cert_pem: self.ca_cert_pem.clone(),
        }
    }

    /// Verifies the CSR's declared Common Name equals `expected_cn`, then
    /// signs it into a 365-day client certificate with EKU = client-auth and
    /// KU = {digital signature, key encipherment}, SAN including
    /// `DNSName(expected_cn)` and `DNSName("localhost")`, SHA-256.
    ///
    /// CN mismatch or a malformed CSR is fatal to *this request only* — the
    /// registry is left untouched and the caller receives a structured
    /// failure (spec §4.4).
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        expected_cn: &str,
    ) -> Result<SignedCertificate, TransportAuthError> {
        let csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|_| TransportAuthError::MissingCn)?;

        let declared_cn = csr_params
            .params
            .distinguished_name
            .get(&DnType::CommonName)
            .map(|v| v.to_string());

        match declared_cn {
            Some(cn) if cn == expected_cn => {}
            Some(cn) => {
                return Err(TransportAuthError::CnMismatch {
                    declared: expected_cn.to_string(),
                    cn,
                })
            }
            None => return Err(TransportAuthError::MissingCn),
        }

        let mut params = csr_params.params;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.subject_alt_names = vec![
            SanType::DnsName(expected_cn.try_into().map_err(|_| TransportAuthError::MissingCn)?),
            SanType::DnsName("localhost".try_into().unwrap()),
        ];
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(CLIENT_CERT_VALIDITY_DAYS);

        let signed = params
            .signed_by(&csr_params.public_key, &self.ca_cert, &self.ca_key)
            .map_err(|_| TransportAuthError::MissingCn)?;

        Ok(SignedCertificate {
            client_cert_pem: signed.pem(),
            ca_cert_pem: self.ca_cert_pem.clone(),
        })
    }
}

fn read_to_string(path: &Path) -> Result<String, FatalStartupError> {
    fs::read_to_string(path)
        .map_err(|e| FatalStartupError::CaLoad(format!("reading {}: {e}", path.display())))
}

fn write_restricted(path: &Path, bytes: &[u8]) -> Result<(), FatalStartupError> {
    fs::write(path, bytes)
        .map_err(|e| FatalStartupError::CaLoad(format!("writing {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| FatalStartupError::CaLoad(format!("chmod {}: {e}", path.display())))?;
    }
    Ok(())
}

pub fn default_ca_dir(database_dir: &Path) -> PathBuf {
    database_dir.join("ca")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let generated = CertificateAuthority::generate(dir.path()).unwrap();
        let creds = generated.server_credentials();
        assert!(creds.server_cert_pem.contains("BEGIN CERTIFICATE"));

        let loaded = CertificateAuthority::load(dir.path()).unwrap();
        assert_eq!(loaded.ca_cert_pem, generated.ca_cert_pem);
    }
}
