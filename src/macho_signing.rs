// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing Mach-O binaries.
//!
//! Signing is a two pass affair. A first pass rewrites the slice with the
//! signature load command pointing at a zero-filled placeholder, so every
//! byte the code directory must hash has its final value. The signature is
//! then built over that image and spliced into the placeholder. If the
//! built signature outgrows the reservation, the pass repeats with the
//! actual size.

use {
    crate::{
        code_directory::{CodeDirectoryBlob, CodeSignatureFlags, ExecutableSegmentFlags},
        code_hash::compute_paged_digests,
        dylib_editing::relayout,
        embedded_signature::{Blob, Digest, EntitlementsBlob, RequirementSetBlob, Slot},
        embedded_signature_builder::EmbeddedSignatureBuilder,
        error::{Error, Result},
        macho::*,
        signing_settings::SigningSettings,
    },
    log::{debug, info},
    std::borrow::Cow,
};

const PAGE_SIZE: usize = 4096;
const LINKEDIT_VM_ALIGN: u64 = 0x4000;
const SIZEOF_CODE_SIGNATURE_COMMAND: usize = 16;

/// Estimate how much space an embedded signature will need.
///
/// Over-estimating wastes a little zero padding; under-estimating costs an
/// extra signing pass. Certificate sizes dominate for non-adhoc signing.
fn estimate_embedded_signature_size(
    code_limit: usize,
    settings: &SigningSettings,
) -> usize {
    // Superblob header, code directory fixed fields, identifier, blob
    // headers, special slot digests.
    let mut size = 1024;

    size += (code_limit / PAGE_SIZE + 17) * settings.digest_type().hash_len();

    if let Some(xml) = settings.entitlements_xml() {
        size += xml.len() + 32;
    }

    if let Some(identity) = settings.identity() {
        // CMS structural overhead plus the certificate chain.
        size += 4096;
        size += identity
            .certificate_chain()
            .iter()
            .map(|cert| cert.constructed_data().len())
            .sum::<usize>();
    }

    align_to(size, 1024)
}

/// Rewrite a slice so its signature load command reserves `reserved` zeroed
/// bytes at the end of __LINKEDIT. Returns the new image and the file
/// offset of the reservation.
fn embed_signature_space(data: &[u8], reserved: usize) -> Result<(Vec<u8>, usize)> {
    let mut view = SliceView::parse(data)?;
    let mut data = Cow::Borrowed(data);

    if view.signature.is_none() {
        // Appending a load command needs room in the header gap.
        let table_end = view.load_commands_end();
        if table_end + SIZEOF_CODE_SIGNATURE_COMMAND > view.first_content_offset {
            let relaid = relayout(&data, &view)?;
            view = SliceView::parse(&relaid)?;
            data = Cow::Owned(relaid);
        }
    }

    let be = view.big_endian;
    let code_limit = if view.signature.is_some() {
        view.code_limit()
    } else {
        align_to(view.code_limit(), 16)
    };

    let mut out = data.to_vec();
    out.resize(code_limit, 0);
    out.resize(code_limit + reserved, 0);

    match view.signature {
        Some((_, _, cmd_offset)) => {
            write_u32(&mut out, cmd_offset + 8, code_limit as u32, be)?;
            write_u32(&mut out, cmd_offset + 12, reserved as u32, be)?;
        }
        None => {
            let offset = view.load_commands_end();
            out[offset..offset + SIZEOF_CODE_SIGNATURE_COMMAND].fill(0);
            write_u32(&mut out, offset, LC_CODE_SIGNATURE, be)?;
            write_u32(&mut out, offset + 4, SIZEOF_CODE_SIGNATURE_COMMAND as u32, be)?;
            write_u32(&mut out, offset + 8, code_limit as u32, be)?;
            write_u32(&mut out, offset + 12, reserved as u32, be)?;
            write_u32(&mut out, 16, view.ncmds + 1, be)?;
            write_u32(
                &mut out,
                20,
                view.sizeofcmds + SIZEOF_CODE_SIGNATURE_COMMAND as u32,
                be,
            )?;
        }
    }

    // __LINKEDIT now ends at the end of the reservation.
    let linkedit = view
        .segment(SEG_LINKEDIT)
        .ok_or(Error::MalformedContainer("no __LINKEDIT segment"))?;
    let new_filesize = (code_limit + reserved) as u64 - linkedit.fileoff;
    let new_vmsize = (new_filesize + LINKEDIT_VM_ALIGN - 1) / LINKEDIT_VM_ALIGN * LINKEDIT_VM_ALIGN;

    if linkedit.is_64 {
        write_u64(&mut out, linkedit.cmd_offset + 32, new_vmsize, be)?;
        write_u64(&mut out, linkedit.cmd_offset + 48, new_filesize, be)?;
    } else {
        write_u32(&mut out, linkedit.cmd_offset + 28, new_vmsize as u32, be)?;
        write_u32(&mut out, linkedit.cmd_offset + 36, new_filesize as u32, be)?;
    }

    Ok((out, code_limit))
}

/// Build the superblob for an image whose signature space is reserved.
fn build_superblob(
    image: &[u8],
    code_limit: usize,
    settings: &SigningSettings,
) -> Result<Vec<u8>> {
    let view = SliceView::parse(image)?;
    let digest_type = settings.digest_type();

    let mut builder = EmbeddedSignatureBuilder::new();

    builder.add_blob(
        Slot::RequirementSet,
        RequirementSetBlob::default().to_blob_bytes()?,
    )?;

    if let Some(xml) = settings.entitlements_xml() {
        builder.add_blob(
            Slot::Entitlements,
            EntitlementsBlob::from_string(xml).to_blob_bytes()?,
        )?;
    }

    let ident = settings
        .binary_identifier()
        .ok_or(Error::NoIdentifier)?
        .to_string();

    let mut flags = CodeSignatureFlags::empty();
    if settings.is_adhoc() {
        flags |= CodeSignatureFlags::ADHOC;
    }

    let mut exec_seg_flags = settings.entitlements_exec_seg_flags();
    if view.is_executable() {
        exec_seg_flags |= ExecutableSegmentFlags::MAIN_BINARY;
    }

    let text = view.segment(SEG_TEXT);
    let (code_limit_32, code_limit_64) = if code_limit > u32::MAX as usize {
        (0, Some(code_limit as u64))
    } else {
        (code_limit as u32, None)
    };

    let cd = CodeDirectoryBlob {
        flags,
        code_limit: code_limit_32,
        code_limit_64,
        digest_type,
        page_size: PAGE_SIZE as u32,
        exec_seg_base: Some(text.map(|t| t.fileoff).unwrap_or(0)),
        exec_seg_limit: Some(text.map(|t| t.fileoff + t.filesize).unwrap_or(0)),
        exec_seg_flags: Some(exec_seg_flags),
        ident: Cow::Owned(ident),
        team_name: settings.team_id().map(|t| Cow::Owned(t.to_string())),
        code_digests: compute_paged_digests(digest_type, &image[0..code_limit], PAGE_SIZE)
            .into_iter()
            .map(|data| Digest {
                data: Cow::Owned(data),
            })
            .collect(),
        ..Default::default()
    };

    debug!(
        "code directory: ident={} pages={} limit={:#x}",
        cd.ident,
        cd.code_digests.len(),
        code_limit
    );

    builder.add_code_directory(cd)?;

    if let Some(identity) = settings.identity() {
        identity.verify_key_matches_certificate()?;
        builder.create_cms_signature(
            identity.signing_key(),
            &identity.certificate,
            &identity.certificate_chain(),
        )?;
    }

    builder.create_superblob()
}

/// Sign one slice, returning the new slice bytes.
pub fn sign_slice_data(data: &[u8], settings: &SigningSettings) -> Result<Vec<u8>> {
    let view = SliceView::parse(data)?;
    view.check_signable(data)?;

    let mut reserved = estimate_embedded_signature_size(view.code_limit(), settings);

    // The reservation influences nothing the code directory hashes, so one
    // retry with the exact size always converges.
    for _ in 0..2 {
        let (mut image, code_limit) = embed_signature_space(data, reserved)?;
        let superblob = build_superblob(&image, code_limit, settings)?;

        if superblob.len() > reserved {
            debug!(
                "reserved {} bytes for signature but need {}; retrying",
                reserved,
                superblob.len()
            );
            reserved = align_to(superblob.len(), 1024);
            continue;
        }

        image[code_limit..code_limit + superblob.len()].copy_from_slice(&superblob);

        return Ok(image);
    }

    Err(Error::SignatureDataTooLarge(reserved, reserved))
}

/// Sign every supported slice of a container in place.
pub fn sign_macho(file: &mut MachFile, settings: &SigningSettings) -> Result<()> {
    for slice in file.slices_mut() {
        if !slice.is_signable_arch() {
            debug!("skipping unsupported {} slice", slice.arch_name());
            continue;
        }

        info!("signing {} slice", slice.arch_name());
        let signed = sign_slice_data(&slice.data, settings)?;
        slice.replace_data(signed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cryptography::SigningIdentity,
            embedded_signature::{DigestKind, EmbeddedSignature},
            fixtures,
        },
        cryptographic_message_syntax::SignedData,
        x509_certificate::{EcdsaCurve, KeyAlgorithm, X509CertificateBuilder},
    };

    fn adhoc_settings() -> SigningSettings<'static> {
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier("com.example.fixture");
        settings
    }

    fn parse_signature(data: &[u8]) -> EmbeddedSignature<'_> {
        let view = SliceView::parse(data).unwrap();
        let (dataoff, datasize, _) = view.signature.expect("no signature command");
        EmbeddedSignature::from_bytes(&data[dataoff as usize..(dataoff + datasize) as usize])
            .unwrap()
    }

    fn test_identity() -> SigningIdentity {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1));
        builder
            .subject()
            .append_common_name_utf8_string("Signing Test")
            .unwrap();
        builder.validity_duration(chrono::Duration::hours(1));
        let (certificate, private_key, _) = builder.create_with_random_keypair().unwrap();

        SigningIdentity {
            private_key,
            certificate,
            chain: vec![],
        }
    }

    #[test]
    fn adhoc_sign_produces_valid_signature() {
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        let signed = sign_slice_data(&data, &adhoc_settings()).unwrap();

        let view = SliceView::parse(&signed).unwrap();
        let (dataoff, datasize, _) = view.signature.unwrap();
        assert_eq!((dataoff + datasize) as usize, signed.len());

        let sig = parse_signature(&signed);
        let cd = sig.code_directory().unwrap().unwrap();

        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.ident, "com.example.fixture");
        assert_eq!(
            cd.code_digests.len(),
            (dataoff as usize + PAGE_SIZE - 1) / PAGE_SIZE
        );
        assert_eq!(cd.code_limit as usize, dataoff as usize);
        assert!(sig.signature_data().unwrap().is_none());
        assert!(cd
            .exec_seg_flags
            .unwrap()
            .contains(ExecutableSegmentFlags::MAIN_BINARY));
    }

    #[test]
    fn page_digests_cover_signable_range() {
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        let signed = sign_slice_data(&data, &adhoc_settings()).unwrap();

        let sig = parse_signature(&signed);
        let cd = sig.code_directory().unwrap().unwrap();

        let expected = compute_paged_digests(
            DigestKind::Sha256,
            &signed[0..cd.code_limit as usize],
            PAGE_SIZE,
        );
        let actual = cd
            .code_digests
            .iter()
            .map(|d| d.data.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn adhoc_signing_is_idempotent() {
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        let settings = adhoc_settings();

        let once = sign_slice_data(&data, &settings).unwrap();
        let twice = sign_slice_data(&once, &settings).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn entitlements_blob_digested_into_directory() {
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        let mut settings = adhoc_settings();
        settings
            .set_entitlements_xml(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>application-identifier</key><string>T.com.example</string></dict></plist>"#,
            )
            .unwrap();

        let signed = sign_slice_data(&data, &settings).unwrap();
        let sig = parse_signature(&signed);

        let ent = sig.entitlements().unwrap().unwrap();
        assert!(ent.as_str().contains("application-identifier"));

        let cd = sig.code_directory().unwrap().unwrap();
        assert!(cd.slot_digest(Slot::Entitlements).is_some());
        assert!(cd.slot_digest(Slot::RequirementSet).is_some());
    }

    #[test]
    fn cms_signature_attached_with_identity() {
        let identity = test_identity();
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);

        let mut settings = SigningSettings::default();
        settings.set_binary_identifier("com.example.fixture");
        settings.set_team_id("TESTTEAM12");
        settings.set_identity(&identity);

        let signed = sign_slice_data(&data, &settings).unwrap();
        let sig = parse_signature(&signed);

        let cd = sig.code_directory().unwrap().unwrap();
        assert!(!cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.team_name.as_deref(), Some("TESTTEAM12"));

        let cms = sig.signature_data().unwrap().expect("missing CMS blob");
        let signed_data = SignedData::parse_ber(cms).unwrap();
        assert_eq!(signed_data.signers().count(), 1);
    }

    #[test]
    fn fat_container_signs_every_slice() {
        let mut file = MachFile::parse(fixtures::fat_macho()).unwrap();
        sign_macho(&mut file, &adhoc_settings()).unwrap();

        for slice in file.slices() {
            let sig = parse_signature(&slice.data);
            let cd = sig.code_directory().unwrap().unwrap();
            assert_eq!(cd.ident, "com.example.fixture");
            // Each slice hashes its own content independently.
            assert!(cd.code_limit as usize <= slice.data.len());
        }

        MachFile::parse(file.serialize().unwrap()).unwrap();
    }

    #[test]
    fn missing_identifier_is_an_error() {
        let data = fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256);
        let settings = SigningSettings::default();
        assert!(matches!(
            sign_slice_data(&data, &settings),
            Err(Error::NoIdentifier)
        ));
    }

    #[test]
    fn signing_after_tight_injection_succeeds() {
        let mut file = MachFile::parse(fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 0))
            .unwrap();
        crate::dylib_editing::inject_dylib(&mut file, "@rpath/libhook.dylib", false).unwrap();

        sign_macho(&mut file, &adhoc_settings()).unwrap();
        let sig = parse_signature(&file.slices()[0].data);
        assert!(sig.code_directory().unwrap().is_some());
    }
}
