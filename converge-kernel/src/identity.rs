//! Identité du tenant, transmise par la passerelle dans `x-rh-identity`
//! (JSON encodé en base64 : `{"identity": {"org_id": ..., "account_number": ...}}`).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const IDENTITY_HEADER: &str = "x-rh-identity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub org_id: String,
    /// Peut être absent pour les organisations sans compte legacy
    #[serde(default)]
    pub account_number: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    identity: RawIdentity,
}

#[derive(Serialize, Deserialize)]
struct RawIdentity {
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    account_number: Option<String>,
}

impl Identity {
    pub fn new(org_id: &str, account_number: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            account_number: account_number.to_string(),
        }
    }

    pub fn decode(header: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(header.trim())
            .map_err(|e| Error::Validation(format!("identity header is not base64: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| Error::Validation(format!("identity header is not valid JSON: {e}")))?;

        let org_id = envelope
            .identity
            .org_id
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| Error::Validation("identity has no org_id".into()))?;
        Ok(Self {
            org_id,
            account_number: envelope.identity.account_number.unwrap_or_default(),
        })
    }

    /// Valeur d'en-tête équivalente
    pub fn encode(&self) -> String {
        let envelope = Envelope {
            identity: RawIdentity {
                org_id: Some(self.org_id.clone()),
                account_number: Some(self.account_number.clone()),
            },
        };
        // sérialiser deux Option<String> ne peut pas échouer
        let json = serde_json::to_vec(&envelope).unwrap_or_default();
        STANDARD.encode(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gateway_header() {
        let header = STANDARD.encode(r#"{"identity":{"org_id":"5318290","account_number":"901578","type":"User"}}"#);
        let identity = Identity::decode(&header).unwrap();
        assert_eq!(identity, Identity::new("5318290", "901578"));
    }

    #[test]
    fn account_number_is_optional() {
        let header = STANDARD.encode(r#"{"identity":{"org_id":"42","account_number":null}}"#);
        assert_eq!(Identity::decode(&header).unwrap().account_number, "");
    }

    #[test]
    fn rejects_missing_org_and_garbage() {
        let no_org = STANDARD.encode(r#"{"identity":{"account_number":"1"}}"#);
        assert!(matches!(Identity::decode(&no_org), Err(Error::Validation(_))));
        assert!(matches!(Identity::decode("%%%"), Err(Error::Validation(_))));
    }

    #[test]
    fn encode_is_decodable() {
        let identity = Identity::new("org-7", "acct-7");
        assert_eq!(Identity::decode(&identity.encode()).unwrap(), identity);
    }
}
