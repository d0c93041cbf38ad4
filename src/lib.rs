// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sign Mach-O binaries and app bundles and patch their dylib references.
//!
//! This crate implements enough of the Apple code signing format to
//! re-sign iOS app bundles: parsing thin and universal Mach-O containers,
//! editing dylib load commands (injection, removal, path rewriting),
//! building code directories and embedded signature superblobs, producing
//! CMS signatures from PKCS#12 or PEM signing identities, and walking
//! bundles so nested content is signed in the right order.
//!
//! The main entry points are:
//!
//! * [macho::MachFile] for parsing and serializing containers.
//! * [dylib_editing] for load command edits.
//! * [macho_signing::sign_macho] for signing individual binaries.
//! * [bundle_signing::BundleSigner] for whole bundles.

pub mod bundle_signing;
pub mod code_directory;
pub mod code_hash;
pub mod cryptography;
pub mod dylib_editing;
pub mod embedded_signature;
pub mod embedded_signature_builder;
pub mod error;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod macho;
pub mod macho_signing;
pub mod provisioning_profile;
pub mod signing_settings;

pub use error::{Error, Result};
