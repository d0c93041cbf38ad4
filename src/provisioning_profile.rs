// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profiles.
//!
//! A `.mobileprovision` file is a CMS SignedData whose payload is a plist
//! describing the entitlements, team, devices, and validity window an app
//! may be signed under.

use {
    crate::{
        cryptography::SigningIdentity,
        error::{Error, Result},
    },
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::SignedData,
    log::debug,
};

pub struct ProvisioningProfile {
    payload: plist::Dictionary,
    raw: Vec<u8>,
}

impl ProvisioningProfile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let signed_data = SignedData::parse_ber(data)?;
        let content = signed_data
            .signed_content()
            .ok_or(Error::ProfileMalformed("no signed payload"))?;

        let value = plist::Value::from_reader(std::io::Cursor::new(content))?;
        let payload = value
            .into_dictionary()
            .ok_or(Error::ProfileMalformed("payload is not a dictionary"))?;

        Ok(Self {
            payload,
            raw: data.to_vec(),
        })
    }

    /// The original CMS bytes, suitable for embedding in a bundle.
    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    pub fn name(&self) -> Option<&str> {
        self.payload.get("Name").and_then(|v| v.as_string())
    }

    pub fn team_identifier(&self) -> Option<&str> {
        // TeamIdentifier is an array of strings; older profiles only carry
        // ApplicationIdentifierPrefix.
        for key in ["TeamIdentifier", "ApplicationIdentifierPrefix"] {
            if let Some(plist::Value::Array(values)) = self.payload.get(key) {
                if let Some(v) = values.first().and_then(|v| v.as_string()) {
                    return Some(v);
                }
            }
        }

        None
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        match self.payload.get("ExpirationDate") {
            Some(plist::Value::Date(date)) => {
                Some(DateTime::<Utc>::from(std::time::SystemTime::from(*date)))
            }
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expiration_date(), Some(date) if date < Utc::now())
    }

    pub fn check_not_expired(&self) -> Result<()> {
        match self.expiration_date() {
            Some(date) if date < Utc::now() => {
                Err(Error::ExpiredProfile(date.to_rfc3339()))
            }
            _ => Ok(()),
        }
    }

    pub fn entitlements(&self) -> Option<&plist::Dictionary> {
        match self.payload.get("Entitlements") {
            Some(plist::Value::Dictionary(dict)) => Some(dict),
            _ => None,
        }
    }

    /// Entitlements rendered as XML, for embedding in a signature.
    pub fn entitlements_xml(&self) -> Result<Option<String>> {
        match self.entitlements() {
            Some(dict) => {
                let mut xml = Vec::new();
                plist::Value::Dictionary(dict.clone()).to_writer_xml(&mut xml)?;
                Ok(Some(String::from_utf8(xml).map_err(|_| {
                    Error::ProfileMalformed("entitlements are not valid UTF-8")
                })?))
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_dictionary(payload: plist::Dictionary) -> Self {
        Self {
            payload,
            raw: vec![],
        }
    }
}

/// Outcome of checking a signing identity against a profile.
#[derive(Debug)]
pub struct IdentityCheck {
    pub valid: bool,
    pub expiration: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Validate that an identity can be used with a profile: the key must
/// match its certificate, the chain must be resolvable, and the profile
/// must not be expired.
pub fn check_identity_validity(
    profile: &ProvisioningProfile,
    identity: &SigningIdentity,
) -> IdentityCheck {
    let expiration = profile.expiration_date();

    if let Err(e) = identity.verify_key_matches_certificate() {
        return IdentityCheck {
            valid: false,
            expiration,
            reason: Some(e.to_string()),
        };
    }

    if let Err(e) = identity.verify_chain_complete() {
        return IdentityCheck {
            valid: false,
            expiration,
            reason: Some(e.to_string()),
        };
    }

    if let Err(e) = profile.check_not_expired() {
        return IdentityCheck {
            valid: false,
            expiration,
            reason: Some(e.to_string()),
        };
    }

    debug!(
        "identity is valid for profile {}",
        profile.name().unwrap_or("<unnamed>")
    );

    IdentityCheck {
        valid: true,
        expiration,
        reason: None,
    }
}
