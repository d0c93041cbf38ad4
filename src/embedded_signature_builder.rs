// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembling embedded signature superblobs.
//!
//! Blobs must arrive in a fixed order: special blobs first, then the code
//! directory (which digests the registered special blobs), then optionally
//! a CMS signature over the code directory. The state machine here makes
//! out of order assembly a hard error rather than a corrupt signature.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{
            create_superblob, magic, Blob, BlobWrapperBlob, Digest, DigestKind, Slot,
        },
        error::{Error, Result},
    },
    bcder::Oid,
    bytes::Bytes,
    cryptographic_message_syntax::{asn1::rfc5652::OID_ID_DATA, SignedDataBuilder, SignerBuilder},
    log::{info, warn},
    std::borrow::Cow,
    x509_certificate::{CapturedX509Certificate, KeyInfoSigner},
};

/// OID for the signed attribute holding the plist of code directory
/// digests (1.2.840.113635.100.9.1).
const CD_DIGESTS_PLIST_OID: bcder::ConstOid =
    Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// Builder for an embedded signature superblob.
#[derive(Default)]
pub struct EmbeddedSignatureBuilder<'a> {
    state: BlobsState,
    blobs: Vec<(Slot, Vec<u8>)>,
    cd: Option<CodeDirectoryBlob<'a>>,
}

impl<'a> EmbeddedSignatureBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_directory(&self) -> Option<&CodeDirectoryBlob<'a>> {
        self.cd.as_ref()
    }

    /// Register a serialized special blob (requirements, entitlements, ...).
    ///
    /// Must be called before the code directory is added so the blob's
    /// digest can be recorded in a special slot.
    pub fn add_blob(&mut self, slot: Slot, blob_bytes: Vec<u8>) -> Result<()> {
        match self.state {
            BlobsState::Empty | BlobsState::SpecialAdded => {}
            _ => {
                return Err(Error::SigningIdentityError(
                    "cannot add blobs after code directory is registered".into(),
                ))
            }
        }

        if slot.special_hash_index().is_none() {
            return Err(Error::SigningIdentityError(format!(
                "slot {:?} cannot be added as a special blob",
                slot
            )));
        }

        self.blobs.push((slot, blob_bytes));
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    /// Register the code directory, recording a digest of every special
    /// blob added so far.
    pub fn add_code_directory(
        &mut self,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<&CodeDirectoryBlob<'a>> {
        if matches!(
            self.state,
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded
        ) {
            return Err(Error::SigningIdentityError(
                "code directory already registered".into(),
            ));
        }

        for (slot, blob) in &self.blobs {
            let digest = cd.digest_type.digest_data(blob);
            cd.set_slot_digest(
                *slot,
                Digest {
                    data: Cow::Owned(digest),
                },
            )?;
        }

        self.cd = Some(cd);
        self.state = BlobsState::CodeDirectoryAdded;

        Ok(self.cd.as_ref().unwrap())
    }

    /// Create and attach a CMS signature over the code directory.
    ///
    /// The signature is a detached SignedData whose signed attributes
    /// include the Apple plist of code directory digests.
    pub fn create_cms_signature(
        &mut self,
        signing_key: &dyn KeyInfoSigner,
        signing_cert: &CapturedX509Certificate,
        certificates: &[CapturedX509Certificate],
    ) -> Result<()> {
        let cd = match (self.state, &self.cd) {
            (BlobsState::CodeDirectoryAdded, Some(cd)) => cd,
            _ => return Err(Error::NoCodeSignature),
        };

        if let Some(cn) = signing_cert.subject_common_name() {
            info!("creating CMS signature with certificate: {}", cn);
        }

        let cd_bytes = cd.to_blob_bytes()?;
        let cd_hash = cd.digest_with(DigestKind::Sha256Truncated)?;

        let mut hashes = plist::Dictionary::new();
        hashes.insert(
            "cdhashes".into(),
            plist::Value::Array(vec![plist::Value::Data(cd_hash)]),
        );

        let mut digests_plist = Vec::new();
        plist::Value::Dictionary(hashes).to_writer_xml(&mut digests_plist)?;

        let signer = SignerBuilder::new(signing_key, signing_cert.clone())
            .message_id_content(cd_bytes)
            .signed_attribute_octet_string(
                Oid(Bytes::copy_from_slice(CD_DIGESTS_PLIST_OID.as_ref())),
                &digests_plist,
            );

        // Apple uses the plain data content type for detached signatures.
        let der = SignedDataBuilder::default()
            .content_type(Oid(OID_ID_DATA.as_ref().into()))
            .signer(signer)
            .certificates(certificates.iter().cloned())
            .build_der()?;

        self.blobs.push((
            Slot::Signature,
            BlobWrapperBlob::from_data(&der).to_blob_bytes()?,
        ));
        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Serialize everything into a superblob.
    pub fn create_superblob(self) -> Result<Vec<u8>> {
        let cd = match self.state {
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded => {
                self.cd.ok_or(Error::NoCodeSignature)?
            }
            _ => {
                warn!("attempted to serialize a signature with no code directory");
                return Err(Error::NoCodeSignature);
            }
        };

        let mut blobs = vec![(Slot::CodeDirectory, cd.to_blob_bytes()?)];
        blobs.extend(self.blobs);
        blobs.sort_by_key(|(slot, _)| u32::from(*slot));

        create_superblob(magic::EMBEDDED_SIGNATURE, &blobs)
    }
}
