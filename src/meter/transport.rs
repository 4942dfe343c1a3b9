/*
    TLS transport for Itron style SEP2 meters

    The meter firmware only speaks TLS 1.2 with ECDHE-ECDSA-AES128-CCM8, a
    cipher OpenSSL 3 hides behind security level 0, and it does not send the
    secure renegotiation extension. Everything here is scoped to the one
    connector the meter client uses.
*/

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, Uri};
use hyper_openssl::client::legacy::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, info};
use openssl::error::ErrorStack;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslFiletype, SslMethod, SslOptions, SslVerifyMode, SslVersion};

use crate::config::Credentials;
use super::{MeterSource, TransportError};

pub const METER_CIPHERS: &str = "ECDHE-ECDSA-AES128-CCM8:@SECLEVEL=0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// SSL_OP_LEGACY_SERVER_CONNECT, no longer part of the OpenSSL 3 defaults
const LEGACY_SERVER_CONNECT: SslOptions = SslOptions::from_bits_retain(0x0000_0004);

/// Client side TLS settings for the meter.
pub fn meter_ssl_builder(creds: &Credentials) -> Result<SslConnectorBuilder, TransportError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(TransportError::Tls)?;

    builder.set_certificate_chain_file(&creds.cert)
        .map_err(|source| TransportError::Credentials { path: creds.cert.clone(), source })?;
    builder.set_private_key_file(&creds.key, SslFiletype::PEM)
        .map_err(|source| TransportError::Credentials { path: creds.key.clone(), source })?;
    builder.check_private_key()
        .map_err(|source| TransportError::Credentials { path: creds.key.clone(), source })?;
    debug!("Loaded client certificate {}", creds.cert.display());

    builder.set_min_proto_version(Some(SslVersion::TLS1_2)).map_err(TransportError::Tls)?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2)).map_err(TransportError::Tls)?;
    builder.set_cipher_list(METER_CIPHERS).map_err(TransportError::Tls)?;

    // Meter certificates are self signed per device
    builder.set_verify(SslVerifyMode::NONE);
    let options = builder.set_options(
        SslOptions::NO_COMPRESSION | SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION | LEGACY_SERVER_CONNECT,
    );

    debug!("TLS context: TLSv1.2 only, ciphers {METER_CIPHERS}, verify none, options {:#x}", options.bits());
    Ok(builder)
}

type MeterClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// HTTPS client bound to one meter. Built once, shared by reference.
pub struct MeterTransport {
    client: MeterClient,
    authority: String,
}

impl MeterTransport {
    pub fn new(base_url: &str, creds: &Credentials) -> Result<Self, TransportError> {
        let base: Uri = base_url.parse().map_err(|_| TransportError::InvalidUrl(base_url.to_string()))?;
        let authority = base.authority()
            .ok_or_else(|| TransportError::InvalidUrl(base_url.to_string()))?
            .to_string();

        let ssl = meter_ssl_builder(creds)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let mut https = HttpsConnector::with_connector(http, ssl).map_err(TransportError::Tls)?;
        https.set_callback(|conf, _uri| {
            conf.set_verify_hostname(false);
            Ok(())
        });

        let client = Client::builder(TokioExecutor::new()).build(https);
        info!("Meter transport ready for {authority}");

        Ok(MeterTransport { client, authority })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn request_for(&self, url: &str) -> Result<Request<Empty<Bytes>>, TransportError> {
        let uri: Uri = url.parse().map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        if uri.authority().map(|a| a.as_str()) != Some(self.authority.as_str()) {
            return Err(TransportError::ForeignHost { url: url.to_string(), authority: self.authority.clone() });
        }

        Request::get(uri)
            .body(Empty::new())
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))
    }
}

#[async_trait]
impl MeterSource for MeterTransport {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String, TransportError> {
        let request = self.request_for(url)?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| classify(&e))?;
            let status = response.status();
            if !status.is_success() {
                debug!("{url} answered with {status}");
            }

            let body = response.into_body()
                .collect()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?
                .to_bytes();

            Ok(String::from_utf8_lossy(&body).into_owned())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// An OpenSSL error anywhere in the chain means the handshake broke.
fn classify(err: &(dyn StdError + 'static)) -> TransportError {
    let mut message = err.to_string();
    let mut tls = false;

    let mut source = err.source();
    while let Some(e) = source {
        if e.downcast_ref::<openssl::ssl::Error>().is_some() || e.downcast_ref::<ErrorStack>().is_some() {
            tls = true;
        }
        let text = e.to_string();
        // hyper already prints part of the chain itself
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = e.source();
    }

    if tls {
        TransportError::Handshake(message)
    } else {
        TransportError::Connection(message)
    }
}
