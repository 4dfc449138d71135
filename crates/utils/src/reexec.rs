use std::path::PathBuf;

use anyhow::Result;

/// Environment variable holding a reference to our original binary
pub const ORIG: &str = "_IMAGER_ORIG_EXE";

/// Return the path to our own executable. When the imager runs from a
/// temporary copy (e.g. inside an unpacked installer container), this
/// environment variable holds the path to the original binary.
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_path_exists() {
        // Tests never set the override, so this is the test binary itself.
        assert!(std::env::var_os(ORIG).is_none());
        let p = executable_path().unwrap();
        assert!(p.exists(), "{p:?}");
    }
}
