// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing app bundles.
//!
//! Nested content is signed before the bundle's main executable, since the
//! main signature may eventually cover resource state. Failures in nested
//! binaries are logged and collected without aborting the run; a failure
//! on the main executable fails the bundle.

use {
    crate::{
        cryptography::SigningIdentity,
        dylib_editing,
        error::{Error, Result},
        macho::MachFile,
        macho_signing::sign_macho,
        provisioning_profile::ProvisioningProfile,
        signing_settings::SigningSettings,
    },
    log::{info, warn},
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Shared flag for cooperative cancellation, checked between binaries.
pub type CancelToken = Arc<AtomicBool>;

/// An on-disk app bundle.
pub struct AppBundle {
    root: PathBuf,
    info: plist::Dictionary,
}

impl AppBundle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let info_path = root.join("Info.plist");

        let info = plist::Value::from_file(&info_path)
            .map_err(|e| Error::BundleMalformed(format!("cannot read {}: {}", info_path.display(), e)))?
            .into_dictionary()
            .ok_or_else(|| {
                Error::BundleMalformed(format!("{} is not a dictionary", info_path.display()))
            })?;

        Ok(Self { root, info })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identifier(&self) -> Option<&str> {
        self.info
            .get("CFBundleIdentifier")
            .and_then(|v| v.as_string())
    }

    pub fn executable_name(&self) -> Result<&str> {
        self.info
            .get("CFBundleExecutable")
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                Error::BundleMalformed(format!(
                    "{} has no CFBundleExecutable",
                    self.root.display()
                ))
            })
    }

    pub fn executable_path(&self) -> Result<PathBuf> {
        Ok(self.root.join(self.executable_name()?))
    }

    fn set_info_string(&mut self, key: &str, value: &str) -> bool {
        let current = self.info.get(key).and_then(|v| v.as_string());
        if current == Some(value) {
            return false;
        }
        self.info
            .insert(key.to_string(), plist::Value::String(value.to_string()));

        true
    }

    fn write_info(&self) -> Result<()> {
        let file = std::fs::File::create(self.root.join("Info.plist"))?;
        plist::Value::Dictionary(self.info.clone())
            .to_writer_xml(std::io::BufWriter::new(file))?;

        Ok(())
    }
}

/// Whether a file or bundle's main executable carries a code signature.
pub fn is_signed_path(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let binary = if path.is_dir() {
        AppBundle::open(path)?.executable_path()?
    } else {
        path.to_path_buf()
    };

    MachFile::parse(std::fs::read(binary)?)?.is_signed()
}

fn binary_identifier_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    name.strip_suffix(".dylib").unwrap_or(&name).to_string()
}

/// Read, sign, and rewrite one Mach-O file, preserving permissions.
fn sign_binary_file(path: &Path, settings: &SigningSettings) -> Result<()> {
    let permissions = std::fs::metadata(path)?.permissions();

    let mut file = MachFile::parse(std::fs::read(path)?)?;
    sign_macho(&mut file, settings)?;

    std::fs::write(path, file.serialize()?)?;
    std::fs::set_permissions(path, permissions)?;

    Ok(())
}

/// Orchestrates signing of a bundle and its nested content.
#[derive(Default)]
pub struct BundleSigner<'a> {
    identity: Option<&'a SigningIdentity>,
    profile: Option<&'a ProvisioningProfile>,
    entitlements_xml: Option<String>,
    bundle_id_override: Option<String>,
    display_name_override: Option<String>,
    version_override: Option<String>,
    suppress_profile_embedding: bool,
    extra_dylibs: Vec<(String, bool)>,
    remove_dylibs: Vec<String>,
    cancel: Option<CancelToken>,
}

/// Result of one bundle signing run.
#[derive(Debug, Default)]
pub struct BundleSigningReport {
    pub signed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl<'a> BundleSigner<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_identity(&mut self, identity: &'a SigningIdentity) {
        self.identity = Some(identity);
    }

    pub fn set_provisioning_profile(&mut self, profile: &'a ProvisioningProfile) {
        self.profile = Some(profile);
    }

    pub fn set_entitlements_xml(&mut self, xml: impl ToString) {
        self.entitlements_xml = Some(xml.to_string());
    }

    pub fn set_bundle_identifier(&mut self, id: impl ToString) {
        self.bundle_id_override = Some(id.to_string());
    }

    pub fn set_display_name(&mut self, name: impl ToString) {
        self.display_name_override = Some(name.to_string());
    }

    pub fn set_bundle_version(&mut self, version: impl ToString) {
        self.version_override = Some(version.to_string());
    }

    /// Do not write embedded.mobileprovision into the bundle.
    pub fn suppress_profile_embedding(&mut self) {
        self.suppress_profile_embedding = true;
    }

    /// Inject a dylib into the main executable before signing.
    pub fn add_dylib(&mut self, path: impl ToString, weak: bool) {
        self.extra_dylibs.push((path.to_string(), weak));
    }

    /// Remove dylib references from the main executable before signing.
    pub fn remove_dylib(&mut self, path: impl ToString) {
        self.remove_dylibs.push(path.to_string());
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Sign a bundle in place.
    pub fn sign_bundle(&self, path: impl AsRef<Path>) -> Result<BundleSigningReport> {
        let mut report = BundleSigningReport::default();
        let mut bundle = AppBundle::open(path)?;

        info!("signing bundle {}", bundle.root().display());

        if let Some(profile) = self.profile {
            profile.check_not_expired()?;
        }
        if let Some(identity) = self.identity {
            identity.verify_key_matches_certificate()?;
        }

        self.apply_info_overrides(&mut bundle)?;
        self.embed_profile(&bundle)?;

        // Nested content first, main executable last.
        for nested in self.collect_nested_binaries(&bundle)? {
            self.check_cancelled()?;

            match self.sign_nested(&nested) {
                Ok(()) => report.signed.push(nested),
                Err(e) => {
                    warn!("failed signing {}: {}", nested.display(), e);
                    report.failed.push((nested, e.to_string()));
                }
            }
        }

        self.check_cancelled()?;
        let main = bundle.executable_path()?;
        self.sign_main_executable(&bundle, &main)?;
        report.signed.push(main);

        info!(
            "bundle {} signed ({} binaries, {} failures)",
            bundle.root().display(),
            report.signed.len(),
            report.failed.len()
        );

        Ok(report)
    }

    fn apply_info_overrides(&self, bundle: &mut AppBundle) -> Result<()> {
        let mut changed = false;

        if let Some(id) = &self.bundle_id_override {
            changed |= bundle.set_info_string("CFBundleIdentifier", id);
        }
        if let Some(name) = &self.display_name_override {
            changed |= bundle.set_info_string("CFBundleDisplayName", name);
        }
        if let Some(version) = &self.version_override {
            changed |= bundle.set_info_string("CFBundleShortVersionString", version);
            changed |= bundle.set_info_string("CFBundleVersion", version);
        }

        if changed {
            info!("rewriting {}/Info.plist with overrides", bundle.root().display());
            bundle.write_info()?;
        }

        Ok(())
    }

    fn embed_profile(&self, bundle: &AppBundle) -> Result<()> {
        if let Some(profile) = self.profile {
            if !self.suppress_profile_embedding {
                let dest = bundle.root().join("embedded.mobileprovision");
                std::fs::write(&dest, profile.raw_data())?;
                info!("embedded provisioning profile at {}", dest.display());
            }
        }

        Ok(())
    }

    fn collect_nested_binaries(&self, bundle: &AppBundle) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();

        for dir in ["Frameworks", "PlugIns"] {
            let dir = bundle.root().join(dir);
            if !dir.is_dir() {
                continue;
            }

            let mut entries = std::fs::read_dir(&dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .collect::<Vec<_>>();
            entries.sort();

            for path in entries {
                let name = path.file_name().unwrap_or_default().to_string_lossy();

                if name.ends_with(".dylib") && path.is_file() {
                    found.push(path);
                } else if name.ends_with(".framework") && path.is_dir() {
                    // The framework binary carries the framework's name.
                    let stem = name.trim_end_matches(".framework");
                    let binary = path.join(stem);
                    if binary.is_file() {
                        found.push(binary);
                    } else {
                        warn!("framework {} has no binary", path.display());
                    }
                } else if name.ends_with(".appex") && path.is_dir() {
                    found.push(path);
                }
            }
        }

        Ok(found)
    }

    fn base_settings(&self) -> SigningSettings<'a> {
        let mut settings = SigningSettings::default();
        if let Some(identity) = self.identity {
            settings.set_identity(identity);
        }
        if let Some(team) = self.profile.and_then(|p| p.team_identifier()) {
            settings.set_team_id(team);
        }

        settings
    }

    fn sign_nested(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            // A nested bundle (app extension). Overrides apply to the outer
            // bundle only.
            let mut nested_signer = BundleSigner::new();
            nested_signer.identity = self.identity;
            nested_signer.profile = self.profile;
            nested_signer.suppress_profile_embedding = true;
            nested_signer.cancel = self.cancel.clone();

            let report = nested_signer.sign_bundle(path)?;
            if let Some((p, reason)) = report.failed.first() {
                warn!("nested bundle content {} failed: {}", p.display(), reason);
            }

            return Ok(());
        }

        let mut settings = self.base_settings();
        settings.set_binary_identifier(binary_identifier_from_path(path));

        sign_binary_file(path, &settings)
    }

    fn sign_main_executable(&self, bundle: &AppBundle, path: &Path) -> Result<()> {
        let identifier = bundle
            .identifier()
            .map(|s| s.to_string())
            .unwrap_or_else(|| binary_identifier_from_path(path));

        let mut settings = self.base_settings();
        settings.set_binary_identifier(&identifier);

        if let Some(xml) = self.resolve_entitlements(&identifier)? {
            settings.set_entitlements_xml(xml)?;
        }

        let permissions = std::fs::metadata(path)?.permissions();
        let mut file = MachFile::parse(std::fs::read(path)?)?;

        for (dylib, weak) in &self.extra_dylibs {
            dylib_editing::inject_dylib(&mut file, dylib, *weak)?;
        }
        if !self.remove_dylibs.is_empty() {
            dylib_editing::uninstall_dylibs(&mut file, &self.remove_dylibs)?;
        }

        sign_macho(&mut file, &settings)?;

        std::fs::write(path, file.serialize()?)?;
        std::fs::set_permissions(path, permissions)?;

        Ok(())
    }

    /// Entitlements for the main executable: explicit XML wins, then the
    /// profile's. The application-identifier is kept consistent with the
    /// effective bundle identifier.
    fn resolve_entitlements(&self, bundle_id: &str) -> Result<Option<String>> {
        if let Some(xml) = &self.entitlements_xml {
            return Ok(Some(xml.clone()));
        }

        let profile = match self.profile {
            Some(profile) => profile,
            None => return Ok(None),
        };

        let mut dict = match profile.entitlements() {
            Some(dict) => dict.clone(),
            None => return Ok(None),
        };

        if let Some(team) = profile.team_identifier() {
            dict.insert(
                "application-identifier".to_string(),
                plist::Value::String(format!("{}.{}", team, bundle_id)),
            );
            dict.insert(
                "com.apple.developer.team-identifier".to_string(),
                plist::Value::String(team.to_string()),
            );
        }

        let mut xml = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut xml)?;

        Ok(Some(String::from_utf8(xml).map_err(|_| {
            Error::ProfileMalformed("entitlements are not valid UTF-8")
        })?))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            embedded_signature::EmbeddedSignature,
            fixtures,
            macho::SliceView,
        },
    };

    fn write_bundle(dir: &Path, identifier: &str) -> PathBuf {
        let root = dir.join("Demo.app");
        std::fs::create_dir_all(root.join("Frameworks")).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleExecutable".into(),
            plist::Value::String("Demo".into()),
        );
        info.insert(
            "CFBundleIdentifier".into(),
            plist::Value::String(identifier.into()),
        );
        let file = std::fs::File::create(root.join("Info.plist")).unwrap();
        plist::Value::Dictionary(info).to_writer_xml(file).unwrap();

        std::fs::write(
            root.join("Demo"),
            fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256),
        )
        .unwrap();
        std::fs::write(
            root.join("Frameworks/libfoo.dylib"),
            fixtures::thin_macho(&["/usr/lib/libSystem.B.dylib"], 256),
        )
        .unwrap();

        root
    }

    fn cd_identifier(path: &Path) -> String {
        let data = std::fs::read(path).unwrap();
        let view = SliceView::parse(&data).unwrap();
        let (dataoff, datasize, _) = view.signature.expect("not signed");
        let sig =
            EmbeddedSignature::from_bytes(&data[dataoff as usize..(dataoff + datasize) as usize])
                .unwrap();
        sig.code_directory().unwrap().unwrap().ident.into_owned()
    }

    #[test]
    fn adhoc_bundle_signing_signs_nested_first() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let report = BundleSigner::new().sign_bundle(&root).unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.signed.len(), 2);
        // Nested dylib precedes the main executable.
        assert!(report.signed[0].ends_with("Frameworks/libfoo.dylib"));
        assert!(report.signed[1].ends_with("Demo"));

        assert!(is_signed_path(&root).unwrap());
        assert_eq!(cd_identifier(&root.join("Demo")), "com.example.demo");
        assert_eq!(
            cd_identifier(&root.join("Frameworks/libfoo.dylib")),
            "libfoo"
        );
    }

    #[test]
    fn identifier_override_applies_to_plist_and_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let mut signer = BundleSigner::new();
        signer.set_bundle_identifier("com.example.renamed");
        signer.set_bundle_version("2.1");
        signer.sign_bundle(&root).unwrap();

        let bundle = AppBundle::open(&root).unwrap();
        assert_eq!(bundle.identifier(), Some("com.example.renamed"));
        assert_eq!(
            bundle.info.get("CFBundleVersion").and_then(|v| v.as_string()),
            Some("2.1")
        );
        assert_eq!(cd_identifier(&root.join("Demo")), "com.example.renamed");
    }

    #[test]
    fn dylib_injection_through_bundle_signing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let mut signer = BundleSigner::new();
        signer.add_dylib("@executable_path/Frameworks/libfoo.dylib", false);
        signer.sign_bundle(&root).unwrap();

        let file = MachFile::parse(std::fs::read(root.join("Demo")).unwrap()).unwrap();
        let libs = dylib_editing::list_dylibs(&file).unwrap();
        assert!(libs
            .iter()
            .any(|l| l.path == "@executable_path/Frameworks/libfoo.dylib"));
        assert!(file.is_signed().unwrap());
    }

    #[test]
    fn expired_profile_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let mut dict = plist::Dictionary::new();
        dict.insert(
            "ExpirationDate".into(),
            plist::Value::Date(plist::Date::from(
                std::time::SystemTime::now() - std::time::Duration::from_secs(3600),
            )),
        );
        let profile = ProvisioningProfile::from_dictionary(dict);

        let mut signer = BundleSigner::new();
        signer.set_provisioning_profile(&profile);

        assert!(matches!(
            signer.sign_bundle(&root),
            Err(Error::ExpiredProfile(_))
        ));
        // Nothing was signed.
        assert!(!is_signed_path(&root).unwrap());
    }

    #[test]
    fn cancellation_stops_before_main_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let token: CancelToken = Arc::new(AtomicBool::new(true));
        let mut signer = BundleSigner::new();
        signer.set_cancel_token(token);

        assert!(matches!(signer.sign_bundle(&root), Err(Error::Cancelled)));
        assert!(!is_signed_path(&root).unwrap());
    }

    #[test]
    fn profile_embedding_can_be_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = write_bundle(tmp.path(), "com.example.demo");

        let profile = ProvisioningProfile::from_dictionary(plist::Dictionary::new());

        let mut signer = BundleSigner::new();
        signer.set_provisioning_profile(&profile);
        signer.suppress_profile_embedding();
        signer.sign_bundle(&root).unwrap();

        assert!(!root.join("embedded.mobileprovision").exists());
    }
}
