//! # Talos boot asset imager
//!
//! This crate turns a [profile](profile::Profile) into a boot artifact:
//! an ISO, a disk image, an installer container image, a kernel, an
//! initramfs with system extensions, a signed UKI or a kernel command line.
//! The [`imager::Imager`] drives the build; the external tools it needs
//! sit behind the capability traits re-exported from its modules.

pub mod cli;
pub mod cmdline;
pub mod constants;
pub mod error;
pub mod extensions;
pub mod image;
pub mod imager;
pub mod install;
pub mod installer_image;
pub mod iso;
pub mod kernel_cmdline;
pub mod meta;
pub mod overlay;
pub mod platforms;
pub mod profile;
pub mod qemuimg;
pub mod quirks;
pub mod reporter;
pub mod uki;

pub use error::{ImagerError, Stage, ValidationError};
pub use imager::{Capabilities, Imager};
pub use profile::Profile;
