//! Device-link URIs
//!
//! A new device shows `nochat://linkdevice?uuid=<id>&pub_key=<key>` (usually
//! as a QR code); an existing device of the account scans it and links the
//! new device under the next free device id.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use url::Url;

use crate::crypto::keys::parse_identity_key;
use crate::error::{ManagerError, ManagerResult};

const LINK_SCHEME: &str = "nochat";
const LINK_HOST: &str = "linkdevice";

/// Unpadded on output, padding optional on input
const LINK_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// What a device presents to be linked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLinkInfo {
    /// Provisioning identifier chosen by the new device
    pub device_identifier: String,
    /// Identity public key of the new device
    pub device_key: Vec<u8>,
}

impl DeviceLinkInfo {
    pub fn new(device_identifier: impl Into<String>, device_key: Vec<u8>) -> Self {
        Self {
            device_identifier: device_identifier.into(),
            device_key,
        }
    }

    pub fn parse(uri: &str) -> ManagerResult<Self> {
        let url = Url::parse(uri).map_err(|e| ManagerError::InvalidLink(e.to_string()))?;
        if url.scheme() != LINK_SCHEME || url.host_str() != Some(LINK_HOST) {
            return Err(ManagerError::InvalidLink(format!(
                "not a device link: {}://{}",
                url.scheme(),
                url.host_str().unwrap_or_default()
            )));
        }

        let mut device_identifier = None;
        let mut encoded_key = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "uuid" => device_identifier = Some(value.into_owned()),
                "pub_key" => encoded_key = Some(value.into_owned()),
                _ => {}
            }
        }

        let device_identifier = device_identifier
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ManagerError::InvalidLink("missing uuid".to_string()))?;
        let encoded_key = encoded_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ManagerError::InvalidLink("missing pub_key".to_string()))?;

        let device_key = LINK_BASE64
            .decode(encoded_key.as_bytes())
            .map_err(|e| ManagerError::InvalidLink(format!("pub_key is not base64: {}", e)))?;
        parse_identity_key(&device_key)
            .map_err(|e| ManagerError::InvalidLink(format!("pub_key: {}", e)))?;

        Ok(Self {
            device_identifier,
            device_key,
        })
    }

    pub fn to_uri(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("uuid", &self.device_identifier)
            .append_pair("pub_key", &LINK_BASE64.encode(&self.device_key))
            .finish();
        format!("{}://{}?{}", LINK_SCHEME, LINK_HOST, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn test_uri_round_trip() {
        let key = IdentityKeyPair::generate().public_key_bytes();
        let info = DeviceLinkInfo::new("d3b07384-d9a0-4c9b-8f5e-1a2b3c4d5e6f", key);

        let uri = info.to_uri();
        assert!(uri.starts_with("nochat://linkdevice?uuid="));
        assert!(!uri.contains("%3D"), "key must be unpadded: {}", uri);
        assert_eq!(DeviceLinkInfo::parse(&uri).unwrap(), info);
    }

    #[test]
    fn test_padded_key_accepted() {
        let key = IdentityKeyPair::generate().public_key_bytes();
        let padded = base64::engine::general_purpose::STANDARD.encode(&key);
        let mut url = Url::parse("nochat://linkdevice").unwrap();
        url.query_pairs_mut()
            .append_pair("uuid", "abc")
            .append_pair("pub_key", &padded);

        assert_eq!(DeviceLinkInfo::parse(url.as_str()).unwrap().device_key, key);
    }

    #[test]
    fn test_invalid_links() {
        for uri in [
            "not a uri",
            "https://linkdevice?uuid=a&pub_key=AAAA",
            "nochat://linkdevice?pub_key=AAAA",
            "nochat://linkdevice?uuid=a",
            "nochat://linkdevice?uuid=a&pub_key=%21%21",
            "nochat://linkdevice?uuid=a&pub_key=AAAA",
        ] {
            assert!(
                matches!(DeviceLinkInfo::parse(uri), Err(ManagerError::InvalidLink(_))),
                "accepted {}",
                uri
            );
        }
    }
}
