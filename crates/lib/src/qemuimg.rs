//! Converting raw disk images to other formats, and packing OVAs.

use std::fs::File;
use std::io::BufWriter;
use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use imager_utils::AsyncCommandRunExt;

use crate::profile::DiskFormat;

/// Where and how to build an OVA.
#[derive(Debug, Clone)]
pub struct OvaOptions {
    /// Appliance name, `<platform>-<arch>`.
    pub name: String,
    /// Architecture.
    pub arch: String,
    /// Size of the virtual disk in bytes.
    pub disk_size: u64,
    /// Scratch space for the vmdk and descriptor.
    pub scratch_dir: Utf8PathBuf,
}

/// Converts raw disk images in place.
#[async_trait]
pub trait Converter: std::fmt::Debug + Send + Sync {
    /// Convert the raw image at `path` to `format` (`qcow2` or `vpc`),
    /// passing `options` to the format driver.
    async fn convert(
        &self,
        path: &Utf8Path,
        format: DiskFormat,
        options: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Replace the raw image at `path` with an OVA.
    async fn create_ova(&self, path: &Utf8Path, opts: &OvaOptions, cancel: &CancellationToken) -> Result<()>;
}

/// `qemu-img`.
#[derive(Debug, Default)]
pub struct QemuImg;

fn qemu_format(format: DiskFormat) -> Result<&'static str> {
    match format {
        DiskFormat::Qcow2 => Ok("qcow2"),
        DiskFormat::Vpc => Ok("vpc"),
        o => anyhow::bail!("qemu-img cannot convert to {o:?} in place"),
    }
}

fn convert_command(src: &Utf8Path, dest: &Utf8Path, format: &str, options: &str) -> Command {
    let mut c = Command::new("qemu-img");
    c.args(["convert", "-f", "raw", "-O", format]);
    if !options.is_empty() {
        c.args(["-o", options]);
    }
    c.arg(src).arg(dest);
    c
}

#[async_trait]
impl Converter for QemuImg {
    #[instrument(level = "debug", skip(self, cancel))]
    async fn convert(
        &self,
        path: &Utf8Path,
        format: DiskFormat,
        options: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tmp = Utf8PathBuf::from(format!("{path}.convert"));
        tokio::process::Command::from(convert_command(path, &tmp, qemu_format(format)?, options))
            .run_cancellable(cancel)
            .await
            .with_context(|| format!("Converting {path} to {format:?}"))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(ova = %opts.name))]
    async fn create_ova(&self, path: &Utf8Path, opts: &OvaOptions, cancel: &CancellationToken) -> Result<()> {
        let vmdk = opts.scratch_dir.join(format!("{}-disk.vmdk", opts.name));
        tokio::fs::create_dir_all(&opts.scratch_dir).await?;
        tokio::process::Command::from(convert_command(
            path,
            &vmdk,
            "vmdk",
            "compat6,subformat=streamOptimized,adapter_type=lsilogic",
        ))
        .run_cancellable(cancel)
        .await
        .context("Converting to vmdk")?;

        let path = path.to_owned();
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || pack_ova(&path, &vmdk, &opts)).await?
    }
}

/// The OVF descriptor for a single-disk appliance.
fn ovf_descriptor(opts: &OvaOptions, vmdk_name: &str, vmdk_size: u64) -> String {
    let name = &opts.name;
    let capacity = opts.disk_size;
    let os_type = match opts.arch.as_str() {
        "arm64" => "other5xLinux64Guest",
        _ => "other3xLinux64Guest",
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" xmlns:vmw="http://www.vmware.com/schema/ovf" xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData">
  <References>
    <File ovf:href="{vmdk_name}" ovf:id="file1" ovf:size="{vmdk_size}"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="{capacity}" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network">
      <Description>The VM Network network</Description>
    </Network>
  </NetworkSection>
  <VirtualSystem ovf:id="{name}">
    <Info>A virtual machine</Info>
    <Name>{name}</Name>
    <OperatingSystemSection ovf:id="100" vmw:osType="{os_type}">
      <Info>The kind of installed guest operating system</Info>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemIdentifier>{name}</vssd:VirtualSystemIdentifier>
        <vssd:VirtualSystemType>vmx-15</vssd:VirtualSystemType>
      </System>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:ElementName>2 virtual CPU(s)</rasd:ElementName>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:ElementName>2048MB of memory</rasd:ElementName>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>2048</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:ElementName>SCSI Controller 0</rasd:ElementName>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>VirtualSCSI</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>0</rasd:AddressOnParent>
        <rasd:ElementName>Hard Disk 1</rasd:ElementName>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>7</rasd:AddressOnParent>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:ElementName>Network adapter 1</rasd:ElementName>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:ResourceSubType>VmxNet3</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#
    )
}

#[context("Hashing {path}")]
fn sha256_file(path: &Utf8Path) -> Result<String> {
    let mut h = Sha256::new();
    std::io::copy(&mut File::open(path)?, &mut h)?;
    Ok(hex::encode(h.finalize()))
}

/// Write the descriptor and manifest next to `vmdk` and tar all three
/// into `dest`, descriptor first.
#[context("Packing OVA {dest}")]
fn pack_ova(dest: &Utf8Path, vmdk: &Utf8Path, opts: &OvaOptions) -> Result<()> {
    let vmdk_name = vmdk.file_name().context("vmdk has no file name")?;
    let vmdk_size = vmdk.metadata()?.len();
    let ovf_name = format!("{}.ovf", opts.name);
    let ovf = opts.scratch_dir.join(&ovf_name);
    std::fs::write(&ovf, ovf_descriptor(opts, vmdk_name, vmdk_size))?;

    let mf_name = format!("{}.mf", opts.name);
    let mf = opts.scratch_dir.join(&mf_name);
    std::fs::write(
        &mf,
        format!(
            "SHA256({ovf_name})= {}\nSHA256({vmdk_name})= {}\n",
            sha256_file(&ovf)?,
            sha256_file(vmdk)?
        ),
    )?;

    let mut tar = tar::Builder::new(BufWriter::new(File::create(dest)?));
    for (path, name) in [
        (ovf.as_path(), ovf_name.as_str()),
        (mf.as_path(), mf_name.as_str()),
        (vmdk, vmdk_name),
    ] {
        tar.append_path_with_name(path, name)
            .with_context(|| format!("Adding {name}"))?;
    }
    tar.into_inner()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}
