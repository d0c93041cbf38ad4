// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for signing operations.

use {
    crate::{
        code_directory::ExecutableSegmentFlags,
        cryptography::SigningIdentity,
        embedded_signature::DigestKind,
        error::Result,
    },
    log::debug,
};

/// Settings driving a signing run.
///
/// Without an identity, signing is ad-hoc: the code directory is flagged
/// accordingly and no CMS signature is produced.
#[derive(Default)]
pub struct SigningSettings<'key> {
    identity: Option<&'key SigningIdentity>,
    team_id: Option<String>,
    binary_identifier: Option<String>,
    entitlements_xml: Option<String>,
    digest_type: Option<DigestKind>,
}

impl<'key> SigningSettings<'key> {
    pub fn set_identity(&mut self, identity: &'key SigningIdentity) {
        self.identity = Some(identity);
    }

    pub fn identity(&self) -> Option<&'key SigningIdentity> {
        self.identity
    }

    pub fn is_adhoc(&self) -> bool {
        self.identity.is_none()
    }

    pub fn set_team_id(&mut self, team_id: impl ToString) {
        self.team_id = Some(team_id.to_string());
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn set_binary_identifier(&mut self, identifier: impl ToString) {
        self.binary_identifier = Some(identifier.to_string());
    }

    pub fn binary_identifier(&self) -> Option<&str> {
        self.binary_identifier.as_deref()
    }

    /// Set entitlements XML. The value is validated as a plist.
    pub fn set_entitlements_xml(&mut self, xml: impl ToString) -> Result<()> {
        let xml = xml.to_string();
        plist::Value::from_reader_xml(std::io::Cursor::new(xml.as_bytes()))?;
        self.entitlements_xml = Some(xml);

        Ok(())
    }

    pub fn entitlements_xml(&self) -> Option<&str> {
        self.entitlements_xml.as_deref()
    }

    pub fn set_digest_type(&mut self, digest_type: DigestKind) {
        self.digest_type = Some(digest_type);
    }

    pub fn digest_type(&self) -> DigestKind {
        self.digest_type.unwrap_or(DigestKind::Sha256)
    }

    /// Executable segment flags implied by the entitlements.
    pub fn entitlements_exec_seg_flags(&self) -> ExecutableSegmentFlags {
        let mut flags = ExecutableSegmentFlags::empty();

        let dict = match self.entitlements_xml.as_deref().and_then(|xml| {
            plist::Value::from_reader_xml(std::io::Cursor::new(xml.as_bytes()))
                .ok()
                .and_then(|v| v.into_dictionary())
        }) {
            Some(dict) => dict,
            None => return flags,
        };

        let truthy = |key: &str| {
            matches!(dict.get(key), Some(plist::Value::Boolean(true)))
        };

        if truthy("get-task-allow") {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED | ExecutableSegmentFlags::DEBUGGER;
        }
        if truthy("run-unsigned-code") {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
        }
        if truthy("dynamic-codesigning") {
            flags |= ExecutableSegmentFlags::JIT;
        }
        if truthy("com.apple.private.cs.debugger") {
            flags |= ExecutableSegmentFlags::DEBUGGER;
        }
        if truthy("com.apple.private.skip-library-validation") {
            flags |= ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION;
        }

        if !flags.is_empty() {
            debug!("entitlements imply executable segment flags {:?}", flags);
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_TASK_ALLOW: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>get-task-allow</key>
    <true/>
</dict>
</plist>"#;

    #[test]
    fn defaults() {
        let settings = SigningSettings::default();
        assert!(settings.is_adhoc());
        assert_eq!(settings.digest_type(), DigestKind::Sha256);
        assert!(settings.entitlements_exec_seg_flags().is_empty());
    }

    #[test]
    fn entitlements_imply_flags() {
        let mut settings = SigningSettings::default();
        settings.set_entitlements_xml(GET_TASK_ALLOW).unwrap();

        let flags = settings.entitlements_exec_seg_flags();
        assert!(flags.contains(ExecutableSegmentFlags::ALLOW_UNSIGNED));
        assert!(flags.contains(ExecutableSegmentFlags::DEBUGGER));
    }

    #[test]
    fn invalid_entitlements_rejected() {
        let mut settings = SigningSettings::default();
        assert!(settings.set_entitlements_xml("not a plist").is_err());
    }
}
