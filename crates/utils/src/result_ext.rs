use std::fmt::Display;

/// Extension methods for results whose errors are only worth logging, such as
/// cleanup failures that must not mask an earlier, primary error.
pub trait ResultExt<T, E: Display> {
    /// Return the Ok value unchanged; in the error case log it and return `None`.
    fn log_err_ok(self, context: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err_ok(self, context: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!("{context}: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err() {
        let r: Result<u32, anyhow::Error> = Ok(42);
        assert_eq!(r.log_err_ok("ok"), Some(42));
        let r: Result<u32, anyhow::Error> = Err(anyhow::anyhow!("removing tempdir"));
        assert_eq!(r.log_err_ok("cleanup"), None);
        let r: Result<(), std::io::Error> = Err(std::io::ErrorKind::NotFound.into());
        assert!(r.log_err_ok("cleanup").is_none());
    }
}
