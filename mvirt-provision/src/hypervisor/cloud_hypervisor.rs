use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{
    DomainHandle, DomainSpec, HypervisorError, HypervisorGateway, Result, VolumeDescriptor,
    VolumeHandle,
};

const CLOUD_HYPERVISOR_BIN: &str = "/usr/bin/cloud-hypervisor";
const QEMU_IMG_BIN: &str = "qemu-img";

/// Gateway that runs each domain as a cloud-hypervisor process and keeps
/// volumes as image files indexed by name under `<data_dir>/volumes`.
pub struct CloudHypervisor {
    data_dir: PathBuf,
    firmware: PathBuf,
}

impl CloudHypervisor {
    pub fn new(data_dir: PathBuf, firmware: PathBuf) -> Self {
        Self { data_dir, firmware }
    }

    fn vm_dir(&self, machine_id: &str) -> PathBuf {
        self.data_dir.join("vm").join(machine_id)
    }

    fn volume_index(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    fn volume_link(&self, name: &str) -> PathBuf {
        self.volume_index().join(name)
    }

    async fn run_checked(cmd: &mut Command, what: &str) -> Result<()> {
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(HypervisorError::CommandFailed {
                command: what.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn create_tap(&self, machine_id: &str, bridge: &str) -> Result<String> {
        let tap = tap_name(machine_id);

        Self::run_checked(
            Command::new("ip").args(["tuntap", "add", &tap, "mode", "tap"]),
            "ip tuntap add",
        )
        .await?;

        // Attach TAP to bridge, then bring it up
        let attached = Self::run_checked(
            Command::new("ip").args(["link", "set", &tap, "master", bridge]),
            "ip link set master",
        )
        .await;
        let up = match attached {
            Ok(()) => {
                Self::run_checked(
                    Command::new("ip").args(["link", "set", &tap, "up"]),
                    "ip link set up",
                )
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = up {
            self.delete_tap(&tap).await;
            return Err(e);
        }

        info!(machine_id = %machine_id, tap = %tap, bridge = %bridge, "Created TAP device and attached to bridge");
        Ok(tap)
    }

    async fn delete_tap(&self, tap: &str) {
        let _ = Command::new("ip")
            .args(["tuntap", "del", tap, "mode", "tap"])
            .output()
            .await;
        debug!(tap = %tap, "Deleted TAP device");
    }
}

#[async_trait]
impl HypervisorGateway for CloudHypervisor {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle> {
        if spec.arch != std::env::consts::ARCH {
            return Err(HypervisorError::Unsupported(format!(
                "cannot run {} guest on {} host",
                spec.arch,
                std::env::consts::ARCH
            )));
        }
        if spec.nic.model != "virtio" {
            warn!(domain = %spec.name, model = %spec.nic.model, "NIC model not supported, using virtio");
        }

        let vm_dir = self.vm_dir(&spec.id);
        tokio::fs::create_dir_all(&vm_dir).await?;
        let api_socket = vm_dir.join("api.sock");
        let serial_socket = vm_dir.join("serial.sock");

        let tap = self.create_tap(&spec.id, &spec.nic.network).await?;

        let mut cmd = Command::new(CLOUD_HYPERVISOR_BIN);
        cmd.args(domain_args(
            spec,
            &self.firmware,
            &api_socket,
            &serial_socket,
            &tap,
        ));

        info!(domain = %spec.name, cmd = ?cmd.as_std(), "Spawning cloud-hypervisor");

        // Log stdout/stderr to files in the domain directory
        let stderr_path = vm_dir.join("cloud-hypervisor.stderr");
        cmd.stdout(std::fs::File::create(vm_dir.join("cloud-hypervisor.stdout"))?);
        cmd.stderr(std::fs::File::create(&stderr_path)?);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.delete_tap(&tap).await;
                return Err(e.into());
            }
        };
        let pid = child.id();

        // Wait briefly to check for immediate failure
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let stderr_output = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            error!(domain = %spec.name, status = ?status, stderr = %stderr_output, "cloud-hypervisor exited immediately");
            self.delete_tap(&tap).await;
            return Err(HypervisorError::CommandFailed {
                command: "cloud-hypervisor".to_string(),
                stderr: stderr_output,
            });
        }

        info!(domain = %spec.name, machine_id = %spec.id, pid = ?pid, "cloud-hypervisor started");

        Ok(DomainHandle {
            name: spec.name.clone(),
            pid,
            api_socket,
        })
    }

    async fn create_storage_volume(&self, volume: &VolumeDescriptor) -> Result<()> {
        // Index by name so lookups don't depend on the location scheme.
        // An entry pointing at another image is never repointed.
        let link = self.volume_link(&volume.name);
        let indexed = match tokio::fs::read_link(&link).await {
            Ok(existing) if existing != Path::new(&volume.path) => {
                warn!(name = %volume.name, existing = %existing.display(), path = %volume.path, "Volume name already indexed for another image");
                return Err(HypervisorError::VolumeExists {
                    name: volume.name.clone(),
                    existing: existing.display().to_string(),
                });
            }
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = Path::new(&volume.path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size = format!("{}M", volume.size_mb);
        info!(name = %volume.name, path = %volume.path, format = %volume.format, size_mb = volume.size_mb, "Creating volume image");

        Self::run_checked(
            Command::new(QEMU_IMG_BIN).args(["create", "-f", &volume.format, &volume.path, &size]),
            "qemu-img create",
        )
        .await?;

        if !indexed {
            tokio::fs::create_dir_all(self.volume_index()).await?;
            tokio::fs::symlink(&volume.path, &link).await?;
        }

        Ok(())
    }

    async fn lookup_storage_volume_by_name(&self, name: &str) -> Result<VolumeHandle> {
        let not_found = |e: std::io::Error| {
            if e.kind() == ErrorKind::NotFound {
                HypervisorError::VolumeNotFound(name.to_string())
            } else {
                HypervisorError::Io(e)
            }
        };

        let path = tokio::fs::read_link(self.volume_link(name))
            .await
            .map_err(not_found)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(not_found)?;

        debug!(name = %name, path = %path.display(), "Resolved volume");

        Ok(VolumeHandle {
            name: name.to_string(),
            path,
            size_bytes: metadata.len(),
        })
    }
}

/// TAP device names are limited to 15 chars.
fn tap_name(machine_id: &str) -> String {
    let suffix: String = machine_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(13)
        .collect();
    format!("vm{suffix}")
}

/// Build the cloud-hypervisor command line for a domain.
fn domain_args(
    spec: &DomainSpec,
    firmware: &Path,
    api_socket: &Path,
    serial_socket: &Path,
    tap: &str,
) -> Vec<String> {
    let mut args = vec![
        "--api-socket".to_string(),
        format!("path={}", api_socket.display()),
        "--serial".to_string(),
        format!("socket={}", serial_socket.display()),
        "--console".to_string(),
        "off".to_string(),
        "--firmware".to_string(),
        firmware.display().to_string(),
        "--cpus".to_string(),
        format!("boot={},max={}", spec.vcpus, spec.vcpus),
    ];

    let mut memory = format!("size={}M", spec.memory_mb);
    if spec.max_memory_mb > spec.memory_mb {
        memory.push_str(&format!(
            ",hotplug_size={}M",
            spec.max_memory_mb - spec.memory_mb
        ));
    }
    args.push("--memory".to_string());
    args.push(memory);

    // Boot image first, then data disks in order, all in one --disk argument
    args.push("--disk".to_string());
    args.push(format!("path={},readonly=on", spec.boot_image));
    for disk in &spec.disks {
        args.push(format!("path={}", disk.path.display()));
    }

    args.push("--net".to_string());
    args.push(format!("tap={},mac={}", tap, spec.nic.mac));

    args
}
