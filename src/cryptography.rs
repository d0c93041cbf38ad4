// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing identities: certificates and their private keys.

use {
    crate::error::{Error, Result},
    log::debug,
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, KeyInfoSigner, Sign},
};

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// Parse PFX data into certificates and a signing key.
///
/// PFX data is commonly encountered in `.p12` files, such as those created
/// when exporting from Keychain Access. If no password was set when the
/// data was created, the password may be the empty string.
///
/// Returns all certificates found plus the private key.
pub fn parse_pfx_data(
    data: &[u8],
    password: &str,
) -> Result<(Vec<CapturedX509Certificate>, InMemorySigningKeyPair)> {
    let pfx = p12::PFX::parse(data)
        .map_err(|e| Error::PfxParseError(format!("input is not a PKCS#12 archive: {:?}", e)))?;

    if !pfx.verify_mac(password) {
        return Err(Error::PfxBadPassword);
    }

    // The authenticated safe is plain data wrapping a sequence of
    // ContentInfo values, each holding key or certificate bags.
    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(Error::PfxParseError(
                "outer content is not plain data".to_string(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| Error::PfxParseError(format!("malformed authenticated safe: {:?}", e)))?;

    let bmp_password = bmp_string(password);

    let mut certificates = Vec::new();
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    Error::PfxParseError("cannot decrypt encrypted safe contents".to_string())
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(Error::PfxParseError(
                    "unsupported content type in authenticated safe".to_string(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| {
            Error::PfxParseError(format!("malformed safe bag sequence: {:?}", e))
        })?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(cert_bag) => match cert_bag {
                    p12::CertBag::X509(cert_data) => {
                        certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                    }
                    p12::CertBag::SDSI(_) => {
                        return Err(Error::PfxParseError(
                            "SDSI certificates are not supported".to_string(),
                        ));
                    }
                },
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        Error::PfxParseError(
                            "cannot decrypt shrouded key bag with the given password".to_string(),
                        )
                    })?;

                    signing_key = Some(InMemorySigningKeyPair::from_pkcs8_der(&decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    return Err(Error::PfxParseError(
                        "unsupported safe bag type".to_string(),
                    ));
                }
            }
        }
    }

    match (certificates.is_empty(), signing_key) {
        (false, Some(signing_key)) => Ok((certificates, signing_key)),
        (true, Some(_)) => Err(Error::PfxParseError(
            "archive contains no certificates".to_string(),
        )),
        (_, None) => Err(Error::PfxParseError(
            "archive contains no private key".to_string(),
        )),
    }
}

/// A private key, its certificate, and any intermediate certificates.
pub struct SigningIdentity {
    pub private_key: InMemorySigningKeyPair,
    pub certificate: CapturedX509Certificate,
    pub chain: Vec<CapturedX509Certificate>,
}

impl SigningIdentity {
    /// Load from PKCS#12 / PFX data.
    ///
    /// The certificate matching the private key becomes the signing
    /// certificate; other certificates in the file become the chain.
    pub fn from_pfx_data(data: &[u8], password: &str) -> Result<Self> {
        let (certificates, private_key) = parse_pfx_data(data, password)?;

        Self::from_parts(private_key, certificates)
    }

    /// Load from PEM data holding `PRIVATE KEY` and `CERTIFICATE` documents.
    pub fn from_pem_data(data: &[u8]) -> Result<Self> {
        let mut certificates = Vec::new();
        let mut private_key = None;

        for doc in pem::parse_many(data)
            .map_err(|e| Error::SigningIdentityError(format!("invalid PEM data: {}", e)))?
        {
            match doc.tag.as_str() {
                "CERTIFICATE" => {
                    certificates.push(CapturedX509Certificate::from_der(doc.contents)?)
                }
                "PRIVATE KEY" => {
                    private_key = Some(InMemorySigningKeyPair::from_pkcs8_der(&doc.contents)?)
                }
                tag => debug!("ignoring PEM document with tag {}", tag),
            }
        }

        let private_key = private_key.ok_or_else(|| {
            Error::SigningIdentityError("no PRIVATE KEY document in PEM data".into())
        })?;

        Self::from_parts(private_key, certificates)
    }

    fn from_parts(
        private_key: InMemorySigningKeyPair,
        certificates: Vec<CapturedX509Certificate>,
    ) -> Result<Self> {
        let key_public = private_key.public_key_data();

        let leaf_index = certificates
            .iter()
            .position(|cert| cert.public_key_data() == key_public)
            .ok_or_else(|| {
                Error::SigningIdentityError(
                    "private key does not match any provided certificate".into(),
                )
            })?;

        let mut certificates = certificates;
        let certificate = certificates.remove(leaf_index);

        Ok(Self {
            private_key,
            certificate,
            chain: certificates,
        })
    }

    /// The signing certificate followed by its chain.
    pub fn certificate_chain(&self) -> Vec<CapturedX509Certificate> {
        let mut chain = vec![self.certificate.clone()];
        chain.extend(self.chain.iter().cloned());

        chain
    }

    /// Verify the private key signs for the certificate's public key.
    pub fn verify_key_matches_certificate(&self) -> Result<()> {
        if self.private_key.public_key_data() == self.certificate.public_key_data() {
            Ok(())
        } else {
            Err(Error::SigningIdentityError(
                "private key does not correspond to the signing certificate".into(),
            ))
        }
    }

    /// Verify every non self-signed link in the chain resolves to a
    /// provided certificate.
    pub fn verify_chain_complete(&self) -> Result<()> {
        let mut current = &self.certificate;

        // The chain is finite, so a cycle means we have seen every cert.
        for _ in 0..=self.chain.len() {
            if current.subject_name() == current.issuer_name() {
                return Ok(());
            }

            match self
                .chain
                .iter()
                .find(|cert| cert.subject_name() == current.issuer_name())
            {
                Some(issuer) => current = issuer,
                None => {
                    let issuer = current
                        .issuer_common_name()
                        .unwrap_or_else(|| "<unknown issuer>".to_string());
                    return Err(Error::IncompleteCertificateChain(issuer));
                }
            }
        }

        Ok(())
    }

    /// The signing key as a trait object for CMS generation.
    pub fn signing_key(&self) -> &dyn KeyInfoSigner {
        &self.private_key
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        x509_certificate::{EcdsaCurve, KeyAlgorithm, X509CertificateBuilder},
    };

    fn self_signed(
        cn: &str,
    ) -> (
        CapturedX509Certificate,
        InMemorySigningKeyPair,
        ring::pkcs8::Document,
    ) {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1));
        builder
            .subject()
            .append_common_name_utf8_string(cn)
            .unwrap();
        builder.validity_duration(chrono::Duration::hours(1));

        builder.create_with_random_keypair().unwrap()
    }

    #[test]
    fn key_certificate_agreement() {
        let (cert, key, _) = self_signed("Unit Test Signer");
        let identity = SigningIdentity::from_parts(key, vec![cert]).unwrap();
        identity.verify_key_matches_certificate().unwrap();
    }

    #[test]
    fn mismatched_key_rejected() {
        let (cert, _, _) = self_signed("Signer A");
        let (_, other_key, _) = self_signed("Signer B");

        assert!(matches!(
            SigningIdentity::from_parts(other_key, vec![cert]),
            Err(Error::SigningIdentityError(_))
        ));
    }

    #[test]
    fn self_signed_chain_is_complete() {
        let (cert, key, _) = self_signed("Unit Test Signer");
        let identity = SigningIdentity::from_parts(key, vec![cert]).unwrap();
        identity.verify_chain_complete().unwrap();
    }

    #[test]
    fn pem_identity_round_trip() {
        let (cert, _, key_der) = self_signed("PEM Signer");

        let mut data = cert.encode_pem().into_bytes();
        data.extend_from_slice(
            pem::encode(&pem::Pem {
                tag: "PRIVATE KEY".to_string(),
                contents: key_der.as_ref().to_vec(),
            })
            .as_bytes(),
        );

        let identity = SigningIdentity::from_pem_data(&data).unwrap();
        identity.verify_key_matches_certificate().unwrap();
        assert!(identity.chain.is_empty());
    }
}
