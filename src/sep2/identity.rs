use std::time::Duration;

use log::{error, info};
use thiserror::Error;

use crate::endpoints::{EndpointVariant, TagSet};
use crate::meter::{MeterSource, RetryPolicy, TransportError};
use crate::meter::transport::METER_CIPHERS;
use super::extract::{extract, ExtractError};

/// DeviceInformation resource of the meter.
pub const DEVICE_INFO_PATH: &str = "/sdev/sdi";

const LFDI: &str = "lFDI";
const SW_VERSION: &str = "swVer";
const MF_ID: &str = "mfID";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Device information request failed: {0}")]
    Fetch(#[from] TransportError),
    #[error("Device information is not valid XML: {0}")]
    Extract(#[from] ExtractError),
    #[error("Device information lacks {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterIdentity {
    pub lfdi: String,
    pub sw_version: String,
    pub mf_id: String,
}

impl MeterIdentity {
    /// Endpoint tree this firmware serves.
    pub fn variant(&self) -> EndpointVariant {
        EndpointVariant::for_firmware(&self.sw_version)
    }
}

/// All three fields are required, unlike regular readings.
pub fn identity_from_xml(raw: &str) -> Result<MeterIdentity, IdentityError> {
    let tags = TagSet::flat([(LFDI, LFDI), (SW_VERSION, SW_VERSION), (MF_ID, MF_ID)]);
    let mut reading = extract(raw, &tags)?;

    let mut take = |field: &'static str| reading.remove(field).ok_or(IdentityError::MissingField(field));
    Ok(MeterIdentity {
        lfdi: take(LFDI)?,
        sw_version: take(SW_VERSION)?,
        mf_id: take(MF_ID)?,
    })
}

async fn resolve_once<S>(source: &S, url: &str, timeout: Duration) -> Result<MeterIdentity, IdentityError>
where
    S: MeterSource + ?Sized,
{
    let result = match source.get_text(url, timeout).await {
        Ok(raw) => identity_from_xml(&raw),
        Err(e) => Err(IdentityError::Fetch(e)),
    };

    if let Err(IdentityError::Fetch(TransportError::Handshake(reason))) = &result {
        error!("TLS handshake with the meter failed: {reason}");
        error!("  Cipher configured: {METER_CIPHERS}");
        error!("  OpenSSL version: {}", openssl::version::version());
    }

    result
}

/// Reads the meter's DeviceInformation. Every failure, including a missing
/// field, is retried within `policy`.
pub async fn resolve<S>(source: &S, base_url: &str, timeout: Duration, policy: &RetryPolicy) -> Result<MeterIdentity, IdentityError>
where
    S: MeterSource + ?Sized,
{
    let url = format!("{}{DEVICE_INFO_PATH}", base_url.trim_end_matches('/'));
    info!("Querying meter at {url}");

    let identity = policy.run("device identity", |_| resolve_once(source, &url, timeout), |_| true).await?;
    info!("Meter {} (manufacturer {}) runs firmware {}", identity.lfdi, identity.mf_id, identity.sw_version);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn device_info(sw_ver: &str) -> String {
        format!(r#"<?xml version="1.0" encoding="UTF-8"?>
<DeviceInformation xmlns="urn:ieee:std:2030.5:ns" href="/sdev/sdi">
  <lFDI>3E4F45AB31EDFE5B67E343E5E4562E31984E23E5</lFDI>
  <mfDate>1494547200</mfDate>
  <mfID>37384</mfID>
  <mfModel>Gen5 Riva</mfModel>
  <primaryPower>0</primaryPower>
  <swVer>{sw_ver}</swVer>
</DeviceInformation>"#)
    }

    /// Serves the queued responses in order, repeating the last one.
    struct ScriptedMeter {
        responses: Mutex<Vec<Result<String, TransportError>>>,
        calls: AtomicU32,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedMeter {
        fn new(mut responses: Vec<Result<String, TransportError>>) -> Self {
            responses.reverse();
            ScriptedMeter { responses: Mutex::new(responses), calls: AtomicU32::new(0), urls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl MeterSource for ScriptedMeter {
        async fn get_text(&self, url: &str, _timeout: Duration) -> Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                match responses.last().unwrap() {
                    Ok(body) => Ok(body.clone()),
                    Err(_) => Err(TransportError::Connection("refused".to_string())),
                }
            }
        }
    }

    #[test]
    fn test_identity_from_device_information() {
        let identity = identity_from_xml(&device_info("2.7.0")).unwrap();
        assert_eq!(identity.lfdi, "3E4F45AB31EDFE5B67E343E5E4562E31984E23E5");
        assert_eq!(identity.mf_id, "37384");
        assert_eq!(identity.sw_version, "2.7.0");
        assert_eq!(identity.variant(), EndpointVariant::Default);
    }

    #[test]
    fn test_legacy_firmware_selects_alternate_variant() {
        let identity = identity_from_xml(&device_info("3.2.39")).unwrap();
        assert_eq!(identity.variant(), EndpointVariant::V3_2_39);
    }

    #[test]
    fn test_missing_identity_field_is_an_error() {
        let xml = r#"<DeviceInformation xmlns="urn:ieee:std:2030.5:ns"><lFDI>AB</lFDI><mfID>1</mfID></DeviceInformation>"#;
        assert!(matches!(identity_from_xml(xml), Err(IdentityError::MissingField("swVer"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_retries_until_complete() {
        let meter = ScriptedMeter::new(vec![
            Err(TransportError::Connection("reset".to_string())),
            Ok("<DeviceInformation xmlns=\"urn:ieee:std:2030.5:ns\"/>".to_string()),
            Ok(device_info("3.2.39")),
        ]);

        let identity = resolve(&meter, "https://10.0.0.5:8081/", Duration::from_secs(4), &RetryPolicy::default()).await.unwrap();
        assert_eq!(identity.sw_version, "3.2.39");
        assert_eq!(meter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(meter.urls.lock().unwrap()[0], "https://10.0.0.5:8081/sdev/sdi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_gives_up_after_budget() {
        let meter = ScriptedMeter::new(vec![Err(TransportError::Connection("refused".to_string()))]);
        let err = resolve(&meter, "https://10.0.0.5:8081", Duration::from_secs(4), &RetryPolicy::default()).await.unwrap_err();
        assert!(matches!(err, IdentityError::Fetch(_)));
        assert_eq!(meter.calls.load(Ordering::SeqCst), 15);
    }
}
