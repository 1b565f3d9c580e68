// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TLS for Secure Connect: 1.3 only, mutual authentication, and only the
//! explicitly configured CA set. The system trust store is never
//! consulted, and key material never appears in logs or `Debug` output.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::SecurityError;

/// Paths to the operational certificate material.
///
/// The hand-written `Debug` keeps paths and passwords out of diagnostics;
/// an operator confirming configuration only needs to know the material is
/// present.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub key_password: Option<String>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &"<redacted>")
            .field("cert", &"<redacted>")
            .field("key", &"<redacted>")
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn read_certs(path: &PathBuf, what: &str) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    let file = File::open(path)
        .map_err(|e| SecurityError::InvalidCertificate(format!("{}: {}", what, e)))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs
        .map_err(|e| SecurityError::InvalidCertificate(format!("{}: {}", what, e)))?;
    if certs.is_empty() {
        return Err(SecurityError::InvalidCertificate(format!("{}: no certificates", what)));
    }
    Ok(certs)
}

fn read_key(material: &TlsMaterial) -> Result<PrivateKeyDer<'static>, SecurityError> {
    if material.key_password.is_some() {
        // Encrypted PEM never reaches the parser; require plain PKCS#8.
        return Err(SecurityError::InvalidCertificate(
            "encrypted private keys are not supported; provide an unencrypted key".into(),
        ));
    }
    let file = File::open(&material.key)
        .map_err(|e| SecurityError::InvalidCertificate(format!("private key: {}", e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| SecurityError::InvalidCertificate(format!("private key: {}", e)))?
        .ok_or_else(|| SecurityError::InvalidCertificate("private key: none found".into()))
}

fn root_store(material: &TlsMaterial) -> Result<RootCertStore, SecurityError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&material.ca, "ca bundle")? {
        roots
            .add(cert)
            .map_err(|e| SecurityError::InvalidCertificate(format!("ca bundle: {}", e)))?;
    }
    Ok(roots)
}

/// Client-side configuration: trusts exactly the configured CAs, offers our
/// operational certificate, TLS 1.3 only.
pub fn client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>, SecurityError> {
    let roots = root_store(material)?;
    let certs = read_certs(&material.cert, "certificate")?;
    let key = read_key(material)?;
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| SecurityError::InvalidCertificate(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Server-side configuration: requires a client certificate chained to the
/// configured CAs, TLS 1.3 only.
pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, SecurityError> {
    let roots = root_store(material)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SecurityError::InvalidCertificate(e.to_string()))?;
    let certs = read_certs(&material.cert, "certificate")?;
    let key = read_key(material)?;
    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| SecurityError::InvalidCertificate(e.to_string()))?;
    Ok(Arc::new(config))
}
