use log::{debug, warn};
use simple_error::{bail, require_with, try_with};
use std::path::{Path, PathBuf};

use crate::result::Result;

pub const INFO_PLIST: &str = "Info.plist";
pub const EXECUTABLE_KEY: &str = "CFBundleExecutable";

fn stem_of(bundle: &Path) -> Result<String> {
    let stem = require_with!(
        bundle.file_stem().and_then(|s| s.to_str()),
        "cannot derive executable name from {}",
        bundle.display()
    );
    Ok(stem.to_string())
}

/// Name of the bundle's main executable as declared in its `Info.plist`.
/// Without an `Info.plist` or without the key we fall back to the bundle's
/// own stem, which is what Xcode names the executable by default.
pub fn executable_name(bundle: &Path) -> Result<String> {
    let plist_path = bundle.join(INFO_PLIST);
    if !plist_path.exists() {
        let stem = stem_of(bundle)?;
        warn!(
            "{} not found, assuming executable {}",
            plist_path.display(),
            stem
        );
        return Ok(stem);
    }

    let value = try_with!(
        plist::Value::from_file(&plist_path),
        "cannot parse {}",
        plist_path.display()
    );
    let dict = require_with!(
        value.as_dictionary(),
        "{} is not a dictionary",
        plist_path.display()
    );
    let name = match dict.get(EXECUTABLE_KEY) {
        None => {
            let stem = stem_of(bundle)?;
            warn!(
                "{} has no {}, assuming executable {}",
                plist_path.display(),
                EXECUTABLE_KEY,
                stem
            );
            return Ok(stem);
        }
        Some(v) => require_with!(
            v.as_string(),
            "{} in {} is not a string",
            EXECUTABLE_KEY,
            plist_path.display()
        ),
    };
    if name.is_empty() || name.contains('/') {
        bail!("invalid {} '{}' in {}", EXECUTABLE_KEY, name, plist_path.display());
    }
    Ok(name.to_string())
}

/// The file codesign will hash: `<bundle>/<executable>`.
pub fn target_path(bundle: &Path) -> Result<PathBuf> {
    let target = bundle.join(executable_name(bundle)?);
    debug!("bundle {} signs {}", bundle.display(), target.display());
    Ok(target)
}
