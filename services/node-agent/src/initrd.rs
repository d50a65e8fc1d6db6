//! Initrd construction for microVM boot.
//!
//! The initrd is a gzip-compressed cpio archive (newc format) with exactly
//! two records, in order: the `ravel-init` executable (0755) and the
//! serialized init config at `/ravel/run.json` (0644). The init binary is
//! held in memory so archive construction is deterministic.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use ravel_init_config::{
    EtcResolv, ImageConfig, InitConfig, IpConfig, NetworkConfig, INIT_BINARY_NAME, RUN_CONFIG_PATH,
};
use thiserror::Error;

use crate::instance::Instance;

/// Root block device the guest kernel mounts.
const ROOT_DEVICE: &str = "/dev/vda";

/// Default nameserver handed to guests.
const DEFAULT_NAMESERVER: &str = "8.8.8.8";

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_TRAILER: &str = "TRAILER!!!";

const MODE_FILE_EXEC: u32 = 0o100755;
const MODE_FILE: u32 = 0o100644;

/// Errors from initrd construction.
#[derive(Debug, Error)]
pub enum InitrdError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),
}

/// Builds initrd images from an in-memory init binary.
pub struct InitrdBuilder {
    init_bin: Vec<u8>,
}

impl InitrdBuilder {
    pub fn from_bytes(init_bin: Vec<u8>) -> Self {
        Self { init_bin }
    }

    /// Load the init binary from disk once, at agent startup.
    pub fn load(path: &std::path::Path) -> io::Result<Self> {
        Ok(Self {
            init_bin: std::fs::read(path)?,
        })
    }

    /// Write a complete initrd for `config` into `out` and flush it.
    pub fn write<W: Write>(&self, out: W, config: &InitConfig) -> Result<(), InitrdError> {
        let gz = GzEncoder::new(out, Compression::fast());
        let mut cpio = NewcWriter::new(gz);

        cpio.write_record(INIT_BINARY_NAME, MODE_FILE_EXEC, &self.init_bin)?;

        let config_json = serde_json::to_vec(config)?;
        cpio.write_record(RUN_CONFIG_PATH, MODE_FILE, &config_json)?;

        let gz = cpio.finish()?;
        gz.finish()?;
        Ok(())
    }
}

/// Assemble the init config for an instance from its record and the resolved
/// image config.
pub fn build_init_config(instance: &Instance, image_config: &ImageConfig) -> InitConfig {
    let network = &instance.network;
    let gateway = network.gateway.to_string();

    InitConfig {
        image_config: image_config.clone(),
        user_override: instance.config.user.clone(),
        cmd_override: instance.config.cmd.clone(),
        entrypoint_override: instance.config.entrypoint.clone(),
        root_device: ROOT_DEVICE.to_string(),
        etc_resolv: EtcResolv {
            nameservers: vec![DEFAULT_NAMESERVER.to_string()],
        },
        extra_env: instance.config.env.clone(),
        network: NetworkConfig {
            ip_configs: vec![IpConfig {
                ip_net: network.ip_net(),
                broadcast: network.broadcast.to_string(),
                gateway: gateway.clone(),
            }],
            default_gateway: gateway,
        },
    }
}

/// Streaming writer for the cpio "newc" format.
///
/// Header fields are fixed (root ownership, zero mtime, sequential inodes)
/// so identical inputs produce identical archives.
struct NewcWriter<W: Write> {
    out: W,
    next_ino: u32,
}

impl<W: Write> NewcWriter<W> {
    fn new(out: W) -> Self {
        Self { out, next_ino: 1 }
    }

    fn write_record(&mut self, name: &str, mode: u32, data: &[u8]) -> io::Result<()> {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.write_header(ino, name, mode, 1, data.len() as u32)?;
        self.out.write_all(data)?;
        self.pad_to_4(data.len())?;
        Ok(())
    }

    fn finish(mut self) -> io::Result<W> {
        self.write_header(0, NEWC_TRAILER, 0, 1, 0)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_header(
        &mut self,
        ino: u32,
        name: &str,
        mode: u32,
        nlink: u32,
        filesize: u32,
    ) -> io::Result<()> {
        // Name is NUL-terminated in the archive.
        let namesize = name.len() as u32 + 1;

        let mut header = Vec::with_capacity(110 + name.len() + 1);
        header.extend_from_slice(NEWC_MAGIC);
        for field in [
            ino,      // c_ino
            mode,     // c_mode
            0,        // c_uid
            0,        // c_gid
            nlink,    // c_nlink
            0,        // c_mtime
            filesize, // c_filesize
            0,        // c_devmajor
            0,        // c_devminor
            0,        // c_rdevmajor
            0,        // c_rdevminor
            namesize, // c_namesize
            0,        // c_check
        ] {
            header.extend_from_slice(format!("{field:08X}").as_bytes());
        }
        header.extend_from_slice(name.as_bytes());
        header.push(0);

        self.out.write_all(&header)?;
        // Header + name are padded to a 4-byte boundary.
        self.pad_to_4(header.len())
    }

    fn pad_to_4(&mut self, written: usize) -> io::Result<()> {
        let rem = written % 4;
        if rem != 0 {
            self.out.write_all(&[0u8; 4][..4 - rem])?;
        }
        Ok(())
    }
}
