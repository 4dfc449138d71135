//! Loopback devices and raw disk files for disk image construction.

use std::env;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imager_utils::CommandRunExt;

/// Environment variable set on the re-executed cleanup helper process.
pub const CLEANUP_HELPER_ENV: &str = "IMAGER_LOOPBACK_CLEANUP_HELPER";

/// Command line flag used to re-execute ourselves as the cleanup helper.
pub const CLEANUP_HELPER_FLAG: &str = "--loopback-cleanup-helper";

/// Create a sparse file of exactly `size` bytes.
#[context("Creating raw disk {path:?} of {size} bytes")]
pub fn create_raw_disk(path: &Path, size: u64) -> Result<()> {
    let f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.set_len(size)?;
    Ok(())
}

/// `--direct-io` setting for `losetup`, from `IMAGER_DIRECT_IO`.
fn direct_io_mode() -> &'static str {
    match env::var("IMAGER_DIRECT_IO").as_deref() {
        Ok("on") => "on",
        _ => "off",
    }
}

/// Run `losetup -d` on `dev`.
fn detach(dev: &str) -> Result<()> {
    Command::new("losetup")
        .args(["-d", dev])
        .run_capture_stderr()
}

/// A file attached as a partitioned loop device.
///
/// While attached, a re-executed copy of this binary watches for our death
/// and detaches the device if we never get to [`LoopbackDevice::close`].
/// Dropping the device detaches it too, logging failures.
#[derive(Debug)]
pub struct LoopbackDevice {
    dev: Utf8PathBuf,
    attached: bool,
    watchdog: Option<std::process::Child>,
}

impl LoopbackDevice {
    /// Attach `path` on the first free loop device, scanning partitions.
    #[context("Attaching loopback device for {path:?}")]
    pub fn new(path: &Path) -> Result<Self> {
        let out = Command::new("losetup")
            .arg("--find")
            .arg("--show")
            .arg("--partscan")
            .arg(format!("--direct-io={}", direct_io_mode()))
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let dev = Utf8PathBuf::from(out.trim());
        tracing::debug!("Attached {path:?} as {dev}");

        let watchdog = spawn_watchdog(&dev)
            .inspect_err(|e| {
                tracing::warn!("No cleanup watchdog for {dev}, it leaks if we are killed: {e:#}")
            })
            .ok();

        Ok(Self {
            dev,
            attached: true,
            watchdog,
        })
    }

    /// The loop device node, e.g. `/dev/loop3`.
    pub fn path(&self) -> &Utf8Path {
        &self.dev
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.attached, false) {
            return Ok(());
        }
        // The watchdog must be gone before we detach, or both of us race on losetup -d.
        if let Some(mut child) = self.watchdog.take() {
            if let Err(e) = child.kill().and_then(|()| child.wait().map(drop)) {
                tracing::debug!("Stopping loopback watchdog: {e}");
            }
        }
        tracing::debug!("Detaching {}", self.dev);
        detach(self.dev.as_str())
    }

    /// Detach the device.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Detaching {} on drop: {e:#}", self.dev);
        }
    }
}

fn spawn_watchdog(dev: &Utf8Path) -> Result<std::process::Child> {
    let exe = imager_utils::reexec::executable_path()?;
    Command::new(exe)
        .arg(CLEANUP_HELPER_FLAG)
        .arg(dev.as_str())
        .env(CLEANUP_HELPER_ENV, "1")
        .stdin(Stdio::null())
        // stdout may be carrying the --tar-to-stdout archive
        .stdout(Stdio::null())
        .spawn()
        .context("Spawning loopback cleanup helper")
}

/// Entry point of the re-executed cleanup helper.
///
/// Arms a parent-death signal, waits for `SIGTERM`, then detaches
/// `device_path`. Refuses to run unless [`CLEANUP_HELPER_ENV`] is set.
pub async fn run_loopback_cleanup_helper(device_path: &str) -> Result<()> {
    anyhow::ensure!(
        env::var_os(CLEANUP_HELPER_ENV).is_some(),
        "{CLEANUP_HELPER_FLAG} is internal and not meant to be invoked directly"
    );
    rustix::process::set_parent_process_death_signal(Some(rustix::process::Signal::TERM))
        .context("Arming parent death signal")?;
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Listening for SIGTERM")?;
    term.recv().await;
    detach(device_path).with_context(|| format!("Detaching leaked {device_path}"))?;
    tracing::info!("Detached leaked loopback device {device_path}");
    Ok(())
}

/// Parse a human-readable size into bytes.
///
/// Accepts plain byte counts and binary (`KiB`, `MiB`, `GiB`, `TiB`, or the
/// single-letter `K`/`M`/`G`/`T` forms) as well as decimal (`kB`, `MB`,
/// `GB`, `TB`) suffixes.
pub fn parse_size(s: &str) -> Result<u64> {
    const KIB: u64 = 1024;
    let suffixes = [
        ("KiB", KIB),
        ("MiB", KIB.pow(2)),
        ("GiB", KIB.pow(3)),
        ("TiB", KIB.pow(4)),
        ("kB", 1000),
        ("MB", 1000u64.pow(2)),
        ("GB", 1000u64.pow(3)),
        ("TB", 1000u64.pow(4)),
        ("K", KIB),
        ("M", KIB.pow(2)),
        ("G", KIB.pow(3)),
        ("T", KIB.pow(4)),
        ("B", 1),
    ];
    let trimmed = s.trim();
    let (digits, mul) = suffixes
        .iter()
        .find_map(|(suffix, mul)| trimmed.strip_suffix(suffix).map(|v| (v.trim_end(), *mul)))
        .unwrap_or((trimmed, 1));
    let v = digits
        .parse::<u64>()
        .with_context(|| format!("Invalid size: {s:?}"))?;
    v.checked_mul(mul)
        .with_context(|| format!("Size overflows: {s:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        let ident_cases = [0u64, 10, 9, 1024]
            .into_iter()
            .map(|k| (k.to_string(), k));
        let cases = [
            ("0M", 0),
            ("10M", 10 << 20),
            ("10MiB", 10 << 20),
            ("1246MiB", 1246 << 20),
            ("6GiB", 6 << 30),
            ("1G", 1 << 30),
            ("8 GiB", 8 << 30),
            ("11T", 11 << 40),
            ("2GB", 2_000_000_000),
            ("512B", 512),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v));
        for (s, v) in ident_cases.chain(cases) {
            assert_eq!(parse_size(&s).unwrap(), v, "Parsing {s}");
        }
    }

    #[test]
    fn test_parse_size_invalid() {
        for s in ["", "GiB", "1.5GiB", "-1", "10XB", "99999999999999999999T"] {
            assert!(parse_size(s).is_err(), "Parsing {s}");
        }
    }

    #[test]
    fn test_direct_io_mode() {
        // Tests never set the variable.
        if env::var_os("IMAGER_DIRECT_IO").is_none() {
            assert_eq!(direct_io_mode(), "off");
        }
    }

    #[tokio::test]
    async fn test_cleanup_helper_requires_env() {
        assert!(env::var_os(CLEANUP_HELPER_ENV).is_none());
        let e = run_loopback_cleanup_helper("/dev/loop99").await.unwrap_err();
        assert!(e.to_string().contains(CLEANUP_HELPER_FLAG), "{e}");
    }

    #[test]
    fn test_create_raw_disk() -> Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("disk.raw");
        create_raw_disk(&p, 1246 << 20)?;
        assert_eq!(std::fs::metadata(&p)?.len(), 1246 << 20);
        // Recreating truncates to the new size
        create_raw_disk(&p, 4096)?;
        assert_eq!(std::fs::metadata(&p)?.len(), 4096);
        Ok(())
    }
}
