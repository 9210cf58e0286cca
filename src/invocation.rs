//! Checks on the codesign command line before we hand it over.

use simple_error::{bail, try_with};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::result::Result;

/// Page digests are only substituted for SHA-1, the width the interposed
/// `CCDigestFinal` hands out.
pub const DIGEST_FLAG: &str = "--digest-algorithm";
pub const REQUIRED_DIGEST: &str = "sha1";
const DIGEST_FLAG_PREFIX: &str = "--digest-algorithm=";
pub const BUNDLE_SUFFIX: &str = ".app";

/// codesign options that consume the next argument.
const OPTIONS_WITH_VALUE: &[&str] = &[
    "-a",
    "--architecture",
    "--bundle-version",
    "-D",
    "--detached",
    "--digest-algorithm",
    "-i",
    "--identifier",
    "-o",
    "--options",
    "-P",
    "--pagesize",
    "-r",
    "--requirements",
    "-R",
    "--test-requirement",
    "-s",
    "--sign",
    "--entitlements",
    "--extract-certificates",
    "--file-list",
    "--keychain",
    "--prefix",
    "--strict",
    "--timestamp",
    "--runtime-version",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// The positional argument, as given.
    pub bundle_arg: OsString,
}

fn is_required_digest(value: &OsStr) -> bool {
    value.as_bytes() == REQUIRED_DIGEST.as_bytes()
}

impl Invocation {
    /// Validates a full argument vector, `args[0]` being the program name.
    pub fn from_args<S: AsRef<OsStr>>(args: &[S]) -> Result<Invocation> {
        let mut bundle: Option<&OsStr> = None;
        let mut uses_sha1 = false;

        let mut iter = args.iter().skip(1).map(|a| -> &OsStr { a.as_ref() });
        while let Some(arg) = iter.next() {
            let bytes = arg.as_bytes();
            if let Some(value) = bytes.strip_prefix(DIGEST_FLAG_PREFIX.as_bytes()) {
                uses_sha1 |= value == REQUIRED_DIGEST.as_bytes();
            } else if OPTIONS_WITH_VALUE.iter().any(|o| o.as_bytes() == bytes) {
                let value = iter.next();
                if bytes == DIGEST_FLAG.as_bytes() {
                    uses_sha1 |= value.map(is_required_digest).unwrap_or(false);
                }
            } else if bytes.starts_with(b"-") {
                // plain flag such as -f or --deep
            } else if let Some(first) = bundle {
                bail!(
                    "multiple candidate bundles found, {} and {}",
                    first.to_string_lossy(),
                    arg.to_string_lossy()
                );
            } else {
                bundle = Some(arg);
            }
        }

        let bundle = match bundle {
            Some(b) => b,
            None => bail!("app path not found in arguments"),
        };
        if !uses_sha1 {
            bail!(
                "must use SHA-1 for hashing, please include the {}={} flag",
                DIGEST_FLAG,
                REQUIRED_DIGEST
            );
        }
        Ok(Invocation {
            bundle_arg: bundle.to_os_string(),
        })
    }

    /// Canonical bundle path. Must name a `.app` bundle once symlinks are
    /// resolved.
    pub fn bundle_path(&self) -> Result<PathBuf> {
        let path = try_with!(
            fs::canonicalize(&self.bundle_arg),
            "cannot resolve {}",
            self.bundle_arg.to_string_lossy()
        );
        if !path.as_os_str().as_bytes().ends_with(BUNDLE_SUFFIX.as_bytes()) {
            bail!("{} is not an {} bundle", path.display(), BUNDLE_SUFFIX);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Result<Invocation> {
        Invocation::from_args(args)
    }

    #[test]
    fn finds_bundle_between_options() {
        let inv = parse(&[
            "codesign",
            "-f",
            "-s",
            "Apple Development",
            "--entitlements",
            "app.xcent",
            "--digest-algorithm=sha1",
            "Foo.app",
        ])
        .expect("valid invocation");
        assert_eq!(inv.bundle_arg, OsString::from("Foo.app"));
    }

    #[test]
    fn accepts_split_digest_flag() {
        let inv = parse(&["codesign", "--digest-algorithm", "sha1", "-s", "-", "Foo.app"])
            .expect("valid invocation");
        assert_eq!(inv.bundle_arg, OsString::from("Foo.app"));
    }

    #[test]
    fn requires_sha1() {
        assert!(parse(&["codesign", "-s", "-", "Foo.app"]).is_err());
        assert!(parse(&["codesign", "--digest-algorithm=sha256", "Foo.app"]).is_err());
        assert!(parse(&["codesign", "--digest-algorithm", "sha256", "Foo.app"]).is_err());
    }

    #[test]
    fn rejects_multiple_positionals() {
        let err = parse(&["codesign", "--digest-algorithm=sha1", "A.app", "B.app"])
            .expect_err("two bundles");
        assert!(err.to_string().contains("A.app"));
        assert!(err.to_string().contains("B.app"));
    }

    #[test]
    fn rejects_missing_positional() {
        assert!(parse(&["codesign", "--digest-algorithm=sha1", "-s", "-"]).is_err());
        // program name alone is not a bundle
        assert!(parse(&["Foo.app"]).is_err());
    }

    #[test]
    fn bundle_path_requires_app_suffix() {
        let dir = tempdir().expect("cannot create tempdir");
        let app = dir.path().join("Foo.app");
        let other = dir.path().join("Foo.framework");
        fs::create_dir(&app).expect("cannot create bundle");
        fs::create_dir(&other).expect("cannot create bundle");

        let inv = Invocation {
            bundle_arg: app.clone().into_os_string(),
        };
        let resolved = inv.bundle_path().expect("resolve");
        assert!(resolved.ends_with("Foo.app"));

        let inv = Invocation {
            bundle_arg: other.into_os_string(),
        };
        assert!(inv.bundle_path().is_err());

        let inv = Invocation {
            bundle_arg: dir.path().join("Missing.app").into_os_string(),
        };
        assert!(inv.bundle_path().is_err());
    }
}
