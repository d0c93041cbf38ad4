// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Unified error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("binary data read/write error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("CMS error: {0}")]
    Cms(#[from] cryptographic_message_syntax::CmsError),

    #[error("X.509 certificate error: {0}")]
    X509(#[from] x509_certificate::X509CertificateError),

    #[error("malformed container: {0}")]
    MalformedContainer(&'static str),

    #[error("data ends prematurely: {0}")]
    TruncatedData(&'static str),

    #[error("no supported architecture in container")]
    UnsupportedArchitecture,

    #[error("file offset arithmetic overflowed during {0}")]
    OffsetOverflow(&'static str),

    #[error("signing identity error: {0}")]
    SigningIdentityError(String),

    #[error("certificate chain is incomplete: missing issuer {0}")]
    IncompleteCertificateChain(String),

    #[error("provisioning profile expired on {0}")]
    ExpiredProfile(String),

    #[error("provisioning profile malformed: {0}")]
    ProfileMalformed(&'static str),

    #[error("binary does not have code signature data")]
    NoCodeSignature,

    #[error("binary has no identifier and none was provided")]
    NoIdentifier,

    #[error("embedded signature data is malformed")]
    SuperblobMalformed,

    #[error("unknown code signature digest type: {0}")]
    UnknownDigestType(u8),

    #[error("{0} is not signable: {1}")]
    BinaryNotSignable(String, &'static str),

    #[error("signature data too large for reserved space ({0} > {1})")]
    SignatureDataTooLarge(usize, usize),

    #[error("PKCS#12 parse failure: {0}")]
    PfxParseError(String),

    #[error("bad password provided to unlock PFX data")]
    PfxBadPassword,

    #[error("bundle is malformed: {0}")]
    BundleMalformed(String),

    #[error("signing was cancelled")]
    Cancelled,

    #[error("unknown command")]
    CliUnknownCommand,
}

pub type Result<T> = std::result::Result<T, Error>;
