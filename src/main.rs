// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::{error, LevelFilter},
    macho_resign::{
        bundle_signing::{is_signed_path, BundleSigner},
        cryptography::SigningIdentity,
        dylib_editing,
        embedded_signature::EmbeddedSignature,
        error::Error,
        macho::MachFile,
        macho_signing,
        provisioning_profile::{check_identity_validity, ProvisioningProfile},
        signing_settings::SigningSettings,
    },
    std::path::Path,
};

const SIGN_ABOUT: &str = "\
Sign a Mach-O binary or an app bundle.

When the input is a bundle directory, nested frameworks, dylibs, and app
extensions are signed before the main executable. Without a signing
identity (--p12 or --pem), an ad-hoc signature is produced.
";

fn load_identity(args: &ArgMatches) -> Result<Option<SigningIdentity>, Error> {
    if let Some(path) = args.value_of("p12") {
        let data = std::fs::read(path)?;
        let password = args.value_of("p12_password").unwrap_or("");

        return Ok(Some(SigningIdentity::from_pfx_data(&data, password)?));
    }

    if let Some(path) = args.value_of("pem") {
        let data = std::fs::read(path)?;

        return Ok(Some(SigningIdentity::from_pem_data(&data)?));
    }

    Ok(None)
}

fn load_profile(args: &ArgMatches) -> Result<Option<ProvisioningProfile>, Error> {
    match args.value_of("profile") {
        Some(path) => Ok(Some(ProvisioningProfile::parse(&std::fs::read(path)?)?)),
        None => Ok(None),
    }
}

fn command_sign(args: &ArgMatches) -> Result<(), Error> {
    let path = Path::new(args.value_of("path").expect("path is required"));
    let identity = load_identity(args)?;
    let profile = load_profile(args)?;

    if path.is_dir() {
        let mut signer = BundleSigner::new();

        if let Some(identity) = &identity {
            signer.set_identity(identity);
        }
        if let Some(profile) = &profile {
            signer.set_provisioning_profile(profile);
        }
        if let Some(ent_path) = args.value_of("entitlements") {
            signer.set_entitlements_xml(std::fs::read_to_string(ent_path)?);
        }
        if let Some(id) = args.value_of("bundle_id") {
            signer.set_bundle_identifier(id);
        }
        if let Some(name) = args.value_of("display_name") {
            signer.set_display_name(name);
        }
        if let Some(version) = args.value_of("bundle_version") {
            signer.set_bundle_version(version);
        }
        if args.is_present("no_embed_profile") {
            signer.suppress_profile_embedding();
        }
        if let Some(dylibs) = args.values_of("dylib") {
            for dylib in dylibs {
                signer.add_dylib(dylib, args.is_present("weak"));
            }
        }
        if let Some(removals) = args.values_of("remove_dylib") {
            for dylib in removals {
                signer.remove_dylib(dylib);
            }
        }

        let report = signer.sign_bundle(path)?;
        for (failed, reason) in &report.failed {
            eprintln!("warning: {} was not signed: {}", failed.display(), reason);
        }
        println!("signed {} binaries in {}", report.signed.len(), path.display());

        return Ok(());
    }

    // Single file signing.
    let mut settings = SigningSettings::default();
    if let Some(identity) = &identity {
        settings.set_identity(identity);
    }
    if let Some(profile) = &profile {
        profile.check_not_expired()?;
        if let Some(team) = profile.team_identifier() {
            settings.set_team_id(team);
        }
    }
    if let Some(ent_path) = args.value_of("entitlements") {
        settings.set_entitlements_xml(std::fs::read_to_string(ent_path)?)?;
    }

    let identifier = match args.value_of("bundle_id") {
        Some(id) => id.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or(Error::NoIdentifier)?,
    };
    settings.set_binary_identifier(identifier);

    let mut file = MachFile::parse(std::fs::read(path)?)?;

    if let Some(dylibs) = args.values_of("dylib") {
        for dylib in dylibs {
            dylib_editing::inject_dylib(&mut file, dylib, args.is_present("weak"))?;
        }
    }
    if let Some(removals) = args.values_of("remove_dylib") {
        let removals = removals.map(|s| s.to_string()).collect::<Vec<_>>();
        dylib_editing::uninstall_dylibs(&mut file, &removals)?;
    }

    macho_signing::sign_macho(&mut file, &settings)?;
    std::fs::write(path, file.serialize()?)?;
    println!("signed {}", path.display());

    Ok(())
}

fn command_is_signed(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");

    if is_signed_path(path)? {
        println!("{}: signed", path);
    } else {
        println!("{}: not signed", path);
    }

    Ok(())
}

fn command_libs(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");
    let file = MachFile::parse(std::fs::read(path)?)?;

    for slice in file.slices() {
        println!("{}:", slice.arch_name());
        for entry in dylib_editing::list_slice_dylibs(slice)? {
            if entry.weak {
                println!("  {} (weak)", entry.path);
            } else {
                println!("  {}", entry.path);
            }
        }
    }

    Ok(())
}

fn command_inject(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");
    let dylib = args.value_of("dylib").expect("dylib is required");

    let mut file = MachFile::parse(std::fs::read(path)?)?;
    if dylib_editing::inject_dylib(&mut file, dylib, args.is_present("weak"))? {
        std::fs::write(path, file.serialize()?)?;
        println!("injected {}", dylib);
    } else {
        println!("{} already references {}", path, dylib);
    }

    Ok(())
}

fn command_uninstall(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");
    let dylibs = args
        .values_of("dylib")
        .expect("dylib is required")
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    let mut file = MachFile::parse(std::fs::read(path)?)?;
    let removed = dylib_editing::uninstall_dylibs(&mut file, &dylibs)?;

    if removed > 0 {
        std::fs::write(path, file.serialize()?)?;
    }
    println!("removed {} dylib reference(s)", removed);

    Ok(())
}

fn command_change_path(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");
    let old = args.value_of("old").expect("old is required");
    let new = args.value_of("new").expect("new is required");

    let mut file = MachFile::parse(std::fs::read(path)?)?;
    if dylib_editing::change_dylib_path(&mut file, old, new)? {
        std::fs::write(path, file.serialize()?)?;
        println!("changed {} -> {}", old, new);
    } else {
        println!("{} does not reference {}", path, old);
    }

    Ok(())
}

fn command_check_identity(args: &ArgMatches) -> Result<(), Error> {
    let identity = load_identity(args)?.ok_or_else(|| {
        Error::SigningIdentityError("--p12 or --pem is required".into())
    })?;
    let profile = load_profile(args)?.ok_or_else(|| {
        Error::ProfileMalformed("--profile is required")
    })?;

    let check = check_identity_validity(&profile, &identity);

    if let Some(expiration) = check.expiration {
        println!("profile expires: {}", expiration.to_rfc3339());
    }
    match check.reason {
        None => println!("identity is valid for this profile"),
        Some(reason) => {
            println!("identity is NOT valid: {}", reason);
            return Err(Error::SigningIdentityError(reason));
        }
    }

    Ok(())
}

fn command_inspect(args: &ArgMatches) -> Result<(), Error> {
    let path = args.value_of("path").expect("path is required");
    let file = MachFile::parse(std::fs::read(path)?)?;

    for slice in file.slices() {
        let view = slice.view()?;
        println!("{} slice ({} bytes):", slice.arch_name(), slice.data.len());

        let (dataoff, datasize, _) = match view.signature {
            Some(sig) => sig,
            None => {
                println!("  not signed");
                continue;
            }
        };

        let sig = EmbeddedSignature::from_bytes(
            &slice.data[dataoff as usize..(dataoff + datasize) as usize],
        )?;
        println!("  signature: {} blob(s), {} bytes reserved", sig.count, datasize);

        if let Some(cd) = sig.code_directory()? {
            println!("  identifier: {}", cd.ident);
            if let Some(team) = &cd.team_name {
                println!("  team: {}", team);
            }
            println!("  flags: {:?}", cd.flags);
            println!("  digest: {:?}", cd.digest_type);
            println!("  code limit: {:#x}", cd.code_limit);
            println!("  pages: {}", cd.code_digests.len());
        }
        if sig.entitlements()?.is_some() {
            println!("  entitlements: present");
        }
        println!(
            "  cms: {}",
            if sig.signature_data()?.is_some() {
                "present"
            } else {
                "absent (ad-hoc)"
            }
        );
    }

    Ok(())
}

fn exit_code_for_error(err: &Error) -> i32 {
    match err {
        Error::MalformedContainer(_)
        | Error::TruncatedData(_)
        | Error::SuperblobMalformed
        | Error::OffsetOverflow(_) => 2,
        Error::UnsupportedArchitecture => 3,
        Error::SigningIdentityError(_)
        | Error::IncompleteCertificateChain(_)
        | Error::PfxParseError(_)
        | Error::PfxBadPassword => 4,
        Error::ExpiredProfile(_) | Error::ProfileMalformed(_) => 5,
        Error::Io(_) => 6,
        _ => 1,
    }
}

fn identity_args(command: Command<'_>) -> Command<'_> {
    command
        .arg(
            Arg::new("p12")
                .long("p12")
                .takes_value(true)
                .help("Path to a PKCS#12 (.p12) file holding the signing identity"),
        )
        .arg(
            Arg::new("p12_password")
                .long("p12-password")
                .takes_value(true)
                .help("Password for the PKCS#12 file"),
        )
        .arg(
            Arg::new("pem")
                .long("pem")
                .takes_value(true)
                .help("Path to PEM data holding a private key and certificate(s)"),
        )
        .arg(
            Arg::new("profile")
                .long("profile")
                .takes_value(true)
                .help("Path to a provisioning profile"),
        )
}

fn main_impl() -> Result<(), Error> {
    let app = Command::new("macho-resign")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign Mach-O binaries and app bundles and patch their dylib references")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        identity_args(
            Command::new("sign")
                .about("Sign a Mach-O binary or app bundle")
                .long_about(SIGN_ABOUT),
        )
        .arg(
            Arg::new("entitlements")
                .long("entitlements")
                .short('e')
                .takes_value(true)
                .help("Path to an entitlements plist to embed"),
        )
        .arg(
            Arg::new("bundle_id")
                .long("bundle-id")
                .short('b')
                .takes_value(true)
                .help("Override the bundle identifier"),
        )
        .arg(
            Arg::new("display_name")
                .long("display-name")
                .takes_value(true)
                .help("Override the bundle display name"),
        )
        .arg(
            Arg::new("bundle_version")
                .long("bundle-version")
                .takes_value(true)
                .help("Override the bundle version"),
        )
        .arg(
            Arg::new("dylib")
                .long("dylib")
                .short('l')
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Inject a dylib load command before signing"),
        )
        .arg(
            Arg::new("weak")
                .long("weak")
                .help("Injected dylibs use weak load commands"),
        )
        .arg(
            Arg::new("remove_dylib")
                .long("remove-dylib")
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Remove a dylib reference before signing"),
        )
        .arg(
            Arg::new("no_embed_profile")
                .long("no-embed-profile")
                .help("Do not write embedded.mobileprovision into the bundle"),
        )
        .arg(
            Arg::new("path")
                .required(true)
                .help("Mach-O file or .app bundle directory"),
        ),
    );

    let app = app.subcommand(
        Command::new("is-signed")
            .about("Report whether a binary or bundle is signed")
            .arg(Arg::new("path").required(true)),
    );

    let app = app.subcommand(
        Command::new("libs")
            .about("List dylib references per architecture")
            .arg(Arg::new("path").required(true)),
    );

    let app = app.subcommand(
        Command::new("inject")
            .about("Inject a dylib load command")
            .arg(
                Arg::new("dylib")
                    .long("dylib")
                    .short('l')
                    .takes_value(true)
                    .required(true)
                    .help("Install path of the dylib to reference"),
            )
            .arg(
                Arg::new("weak")
                    .long("weak")
                    .help("Use a weak load command"),
            )
            .arg(Arg::new("path").required(true)),
    );

    let app = app.subcommand(
        Command::new("uninstall")
            .about("Remove dylib references")
            .arg(
                Arg::new("dylib")
                    .long("dylib")
                    .short('l')
                    .takes_value(true)
                    .required(true)
                    .multiple_occurrences(true)
                    .help("Install path of the dylib reference to remove"),
            )
            .arg(Arg::new("path").required(true)),
    );

    let app = app.subcommand(
        Command::new("change-path")
            .about("Rewrite a dylib reference path")
            .arg(
                Arg::new("old")
                    .required(true)
                    .help("Existing install path"),
            )
            .arg(Arg::new("new").required(true).help("Replacement path"))
            .arg(Arg::new("path").required(true)),
    );

    let app = app.subcommand(identity_args(
        Command::new("check-identity")
            .about("Validate a signing identity against a provisioning profile"),
    ));

    let app = app.subcommand(
        Command::new("inspect")
            .about("Describe the signature state of a binary")
            .arg(Arg::new("path").required(true)),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(args),
        Some(("is-signed", args)) => command_is_signed(args),
        Some(("libs", args)) => command_libs(args),
        Some(("inject", args)) => command_inject(args),
        Some(("uninstall", args)) => command_uninstall(args),
        Some(("change-path", args)) => command_change_path(args),
        Some(("check-identity", args)) => command_check_identity(args),
        Some(("inspect", args)) => command_inspect(args),
        _ => Err(Error::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            eprintln!("Error: {}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code)
}
