use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use tandem_db::message::DomainError;

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum AddressType {
    #[strum(serialize = "agent")]
    Agent,
    #[strum(serialize = "extension")]
    Extension,
    #[strum(serialize = "tel")]
    Tel,
    #[strum(serialize = "sip")]
    Sip,
    #[strum(serialize = "conference")]
    Conference,
}

/// A dialable party. The wire form is `<type>:<target>`, and callers
/// routinely hand it over percent encoded (`agent%3A<uuid>`), so the
/// string is decoded before the first colon is split off.
#[derive(Deserialize, Serialize, PartialEq, Clone, Debug)]
pub struct Address {
    pub address_type: String,
    pub target: String,
    #[serde(default)]
    pub target_name: String,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Address> {
        let decoded = urlencoding::decode(raw)?.into_owned();
        let mut parts = decoded.splitn(2, ':');
        let address_type = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        if target.is_empty() {
            return Err(DomainError::UnsupportedReferenceType(
                decoded.to_string(),
            )
            .into());
        }
        AddressType::from_str(address_type).map_err(|_| {
            DomainError::UnsupportedReferenceType(address_type.to_string())
        })?;
        Ok(Address {
            address_type: address_type.to_string(),
            target: target.to_string(),
            target_name: "".to_string(),
        })
    }

    pub fn address_type(&self) -> Option<AddressType> {
        AddressType::from_str(&self.address_type).ok()
    }

    /// Switch endpoint string for this party.
    pub fn endpoint(&self) -> String {
        match self.address_type() {
            Some(AddressType::Agent) => format!("PJSIP/{}", self.target),
            Some(AddressType::Extension) => {
                format!("Local/{}@tandem", self.target)
            }
            Some(AddressType::Tel) => format!("PJSIP/{}@trunk", self.target),
            Some(AddressType::Sip) => format!("PJSIP/{}", self.target),
            Some(AddressType::Conference) => {
                format!("Local/{}@conference", self.target)
            }
            None => self.target.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_address() {
        let address = Address::parse("tel:+15551234567").unwrap();
        assert_eq!(address.address_type(), Some(AddressType::Tel));
        assert_eq!(address.target, "+15551234567");
        assert_eq!(address.endpoint(), "PJSIP/+15551234567@trunk");
    }

    #[test]
    fn parses_percent_encoded_agent() {
        let address =
            Address::parse("agent%3A9f1c2b3a-0000-4000-8000-aabbccddeeff")
                .unwrap();
        assert_eq!(address.address_type(), Some(AddressType::Agent));
        assert_eq!(address.target, "9f1c2b3a-0000-4000-8000-aabbccddeeff");
    }

    #[test]
    fn sip_target_keeps_user_and_host() {
        let address = Address::parse("sip:alice@example.com").unwrap();
        assert_eq!(address.target, "alice@example.com");
        assert_eq!(address.endpoint(), "PJSIP/alice@example.com");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Address::parse("fax:12345").is_err());
        assert!(Address::parse("agent").is_err());
    }
}
