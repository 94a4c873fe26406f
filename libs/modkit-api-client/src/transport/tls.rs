//! TLS setup shared by the HTTP connector and secure sockets.
//!
//! Native root certificates are loaded from the OS store once per process;
//! some platforms make that lookup slow.

use crate::config::{TlsRootConfig, TransportSecurity};
use crate::error::ApiError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

/// Empty vec means the OS store had no usable certs (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let certs = result.certs;
    if certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = certs.len(), "loaded native root certificates");
    }
    certs
}

/// Cached native root certificates (may be empty).
#[must_use]
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Globally installed crypto provider if any, otherwise aws-lc-rs without
/// installing it globally.
#[must_use]
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn root_store(tls_roots: TlsRootConfig) -> Result<rustls::RootCertStore, ApiError> {
    let mut store = rustls::RootCertStore::empty();
    match tls_roots {
        TlsRootConfig::WebPki => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsRootConfig::Native => {
            let certs = native_root_certs();
            if certs.is_empty() {
                return Err(ApiError::Tls(
                    "no native root CA certificates found in OS certificate store".into(),
                ));
            }
            let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
            if ignored > 0 {
                tracing::warn!(added, ignored, "some native root certificates could not be parsed");
            }
            if added == 0 {
                return Err(ApiError::Tls(
                    format!(
                        "no valid native root CA certificates parsed (found {}, all failed to parse)",
                        certs.len()
                    )
                    .into(),
                ));
            }
        }
    }
    Ok(store)
}

/// Build a rustls `ClientConfig` for the given root source.
///
/// # Errors
/// Returns `ApiError::Tls` when no usable roots exist or protocol setup fails.
pub fn client_config(tls_roots: TlsRootConfig) -> Result<rustls::ClientConfig, ApiError> {
    let roots = root_store(tls_roots)?;
    let config = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ApiError::Tls(Box::new(e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// HTTPS connector advertising h2 and http/1.1 via ALPN.
///
/// Plain `http` is only accepted under `TransportSecurity::AllowInsecureHttp`.
///
/// # Errors
/// Returns `ApiError::Tls` if the root store cannot be built.
pub fn https_connector(
    tls_roots: TlsRootConfig,
    transport: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, ApiError> {
    let builder = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(get_crypto_provider())
            .map_err(|e| ApiError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => {
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(client_config(tls_roots)?)
        }
    };
    let connector = if transport == TransportSecurity::AllowInsecureHttp {
        builder.https_or_http().enable_all_versions().build()
    } else {
        builder.https_only().enable_all_versions().build()
    };
    Ok(connector)
}
