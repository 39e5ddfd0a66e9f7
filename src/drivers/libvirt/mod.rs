//! Copy-on-write clones of libvirt domains.
//!
//! Every disk of the base domain gets a qcow2 overlay backed by the base
//! image, so the base is never written to. The clone is defined on top of
//! the overlays with `virt-clone --preserve-data`, receives its filesystem
//! mappings through `virt-xml`, and is started. Teardown destroys and
//! undefines the clone and deletes the overlays.
//!
//! A provisioned clone can be shut down and kept as an image. Its domain
//! description carries a JSON stamp with the cache key and expiration tag,
//! and clones made from it are stamped with the image name so a stale image
//! is only deleted once nothing is backed by it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, ImageCache, InstanceHandle,
    ProvisionReuse,
};
use crate::config::OvercastConfig;
use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError};
use crate::host_spec::{FilesystemMapping, LibvirtSpec};
use crate::wait::{PollPolicy, poll_until};

use super::run_tool;

mod tables;

pub use tables::{BlockDevice, Interface, parse_domblklist, parse_domiflist, parse_capacity};

const KIND: BackendKind = BackendKind::Hypervisor;
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const OVERLAYS_KEY: &str = "overlays";
const MISSING_DOMAIN: &str = "failed to get domain";
const MISSING_VOLUME: &str = "Storage volume not found";

/// Locations of the libvirt command-line tools.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibvirtTools {
    /// `virsh` executable.
    pub virsh: String,
    /// `virt-clone` executable.
    pub virt_clone: String,
    /// `virt-xml` executable.
    pub virt_xml: String,
}

impl LibvirtTools {
    /// Reads tool paths from the global configuration.
    #[must_use]
    pub fn from_config(config: &OvercastConfig) -> Self {
        Self {
            virsh: config.virsh_bin.clone(),
            virt_clone: config.virt_clone_bin.clone(),
            virt_xml: config.virt_xml_bin.clone(),
        }
    }
}

impl Default for LibvirtTools {
    fn default() -> Self {
        Self {
            virsh: String::from("virsh"),
            virt_clone: String::from("virt-clone"),
            virt_xml: String::from("virt-xml"),
        }
    }
}

/// One overlay volume created for a clone.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Overlay {
    pool: String,
    name: String,
    path: String,
}

impl Overlay {
    fn encode(overlays: &[Self]) -> String {
        overlays
            .iter()
            .map(|overlay| format!("{}/{}", overlay.pool, overlay.name))
            .collect::<Vec<_>>()
            .join(";")
    }

    fn decode(value: &str) -> Vec<(String, String)> {
        value
            .split(';')
            .filter_map(|entry| entry.split_once('/'))
            .map(|(pool, name)| (pool.to_owned(), name.to_owned()))
            .collect()
    }
}

/// Ownership stamp written into the description of domains this driver
/// keeps around.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "overcast", rename_all = "lowercase")]
enum Stamp {
    /// A provisioned image.
    Image { key: String, tag: String },
    /// A clone backed by an image.
    Clone { image: String },
}

impl Stamp {
    fn parse(description: &str) -> Option<Self> {
        serde_json::from_str(description.trim()).ok()
    }
}

/// Clones a base domain for each host.
pub struct LibvirtDriver {
    spec: LibvirtSpec,
    tools: LibvirtTools,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl LibvirtDriver {
    /// Creates a driver for one base domain.
    #[must_use]
    pub const fn new(
        spec: LibvirtSpec,
        tools: LibvirtTools,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            spec,
            tools,
            runner,
            poll_interval: STATE_POLL_INTERVAL,
        }
    }

    fn virsh(&self) -> CommandLine {
        CommandLine::new(&self.tools.virsh)
            .arg("-c")
            .arg(&self.spec.url)
    }

    async fn virsh_output(&self, arguments: &[&str]) -> Result<CommandOutput, ExecError> {
        let command = self.virsh().args(arguments.iter().copied());
        run_tool(self.runner.as_ref(), &command).await
    }

    async fn domain_state(&self, domain: &str) -> Result<String, ExecError> {
        let output = self.virsh_output(&["domstate", domain]).await?;
        Ok(output.first_line().unwrap_or_default().to_owned())
    }

    async fn wait_for_state(&self, domain: &str, wanted: &str) -> Result<(), BackendError> {
        let policy = PollPolicy::new(self.spec.start_timeout, self.poll_interval);
        poll_until("domain state", policy, |_| async move {
            let state = self.domain_state(domain).await?;
            debug!(domain, state, wanted, "polled domain state");
            Ok::<_, ExecError>((state == wanted).then_some(()))
        })
        .await
        .map_err(|exhausted| {
            BackendError::creation(
                KIND,
                format!(
                    "domain {domain} not {wanted} after {}s: {}",
                    self.spec.start_timeout.as_secs(),
                    exhausted.describe_last()
                ),
            )
        })
    }

    async fn create_overlays(
        &self,
        source: &str,
        clone: &str,
        created: &mut Vec<Overlay>,
    ) -> Result<(), ExecError> {
        let listing = self
            .virsh_output(&["domblklist", source, "--details"])
            .await?;
        for (index, disk) in parse_domblklist(&listing.stdout).iter().enumerate() {
            let pool_output = self.virsh_output(&["vol-pool", &disk.source]).await?;
            let pool = pool_output.first_line().unwrap_or_default().to_owned();
            let info = self
                .virsh_output(&["vol-info", &disk.source, "--bytes"])
                .await?;
            let capacity = parse_capacity(&info.stdout).unwrap_or_default();
            let name = format!("{clone}-{index:02}.qcow2");

            self.virsh_output(&[
                "vol-create-as",
                &pool,
                &name,
                &capacity.to_string(),
                "--format",
                "qcow2",
                "--backing-vol",
                &disk.source,
                "--backing-vol-format",
                "qcow2",
            ])
            .await?;
            let path_output = self
                .virsh_output(&["vol-path", "--pool", &pool, &name])
                .await?;
            let path = path_output.first_line().unwrap_or_default().to_owned();
            debug!(clone, disk = %disk.target, overlay = %path, "created overlay");
            created.push(Overlay { pool, name, path });
        }
        Ok(())
    }

    async fn define_clone(
        &self,
        source: &str,
        clone: &str,
        overlays: &[Overlay],
    ) -> Result<(), ExecError> {
        let mut command = CommandLine::new(&self.tools.virt_clone)
            .arg("--connect")
            .arg(&self.spec.url)
            .arg("--original")
            .arg(source)
            .arg("--name")
            .arg(clone)
            .arg("--preserve-data");
        for overlay in overlays {
            command = command.arg("--file").arg(&overlay.path);
        }
        run_tool(self.runner.as_ref(), &command).await.map(drop)
    }

    async fn apply_mapping(&self, clone: &str, mapping: &FilesystemMapping) -> Result<(), ExecError> {
        let virt_xml = || {
            CommandLine::new(&self.tools.virt_xml)
                .arg("--connect")
                .arg(&self.spec.url)
                .arg(clone)
        };

        let remove = virt_xml()
            .arg("--remove-device")
            .arg("--filesystem")
            .arg(format!("target.dir={}", mapping.target));
        let removed = self.runner.run(&remove).await?;
        if !removed.is_success() && !removed.stderr.contains("No matching objects") {
            return Err(ExecError::failure(&self.tools.virt_xml, &removed));
        }

        let mut device = format!(
            "source.dir={},target.dir={},accessmode={}",
            mapping.host_path,
            mapping.target,
            mapping.access_mode.as_str()
        );
        if mapping.read_only {
            device.push_str(",readonly=on");
        }
        let add = virt_xml()
            .arg("--add-device")
            .arg("--filesystem")
            .arg(device);
        run_tool(self.runner.as_ref(), &add).await.map(drop)
    }

    async fn build_clone(
        &self,
        source: &str,
        clone: &str,
        stamp: Option<&Stamp>,
        overlays: &mut Vec<Overlay>,
    ) -> Result<(), BackendError> {
        let creation = |err: ExecError| BackendError::creation(KIND, err);

        self.wait_for_state(source, "shut off").await?;
        self.create_overlays(source, clone, overlays).await.map_err(creation)?;
        self.define_clone(source, clone, overlays).await.map_err(creation)?;
        for mapping in &self.spec.fs_mappings {
            self.apply_mapping(clone, mapping).await.map_err(creation)?;
        }
        if let Some(stamp) = stamp {
            self.write_stamp(clone, stamp).await?;
        }
        self.virsh_output(&["start", clone]).await.map_err(creation)?;
        self.wait_for_state(clone, "running").await
    }

    /// Clones `source` into a fresh running domain, removing whatever was
    /// created when any step fails.
    async fn clone_domain(
        &self,
        source: &str,
        stamp: Option<&Stamp>,
    ) -> Result<InstanceHandle, BackendError> {
        let clone = format!("{}-{}", self.spec.base_domain, Uuid::new_v4());
        info!(source, clone, "cloning domain");

        let mut overlays = Vec::new();
        if let Err(err) = self
            .build_clone(source, &clone, stamp, &mut overlays)
            .await
        {
            let created: Vec<(String, String)> = overlays
                .iter()
                .map(|overlay| (overlay.pool.clone(), overlay.name.clone()))
                .collect();
            let leftover = self
                .remove_clone(&clone, &created)
                .await
                .err()
                .filter(|cleanup| !cleanup.is_gone());
            if let Some(cleanup) = leftover {
                warn!(clone, error = %cleanup, "could not remove clone after failed start");
            }
            return Err(err);
        }

        if !self.spec.boot_delay.is_zero() {
            debug!(clone, delay = ?self.spec.boot_delay, "waiting for clone to boot");
            sleep(self.spec.boot_delay).await;
        }
        info!(clone, "clone running");
        Ok(InstanceHandle::new(clone).with_metadata(OVERLAYS_KEY, Overlay::encode(&overlays)))
    }

    async fn write_stamp(&self, domain: &str, stamp: &Stamp) -> Result<(), BackendError> {
        let description = serde_json::to_string(stamp)
            .map_err(|err| BackendError::creation(KIND, format!("encoding stamp: {err}")))?;
        self.virsh_output(&["desc", domain, "--config", "--new-desc", &description])
            .await
            .map(drop)
            .map_err(|err| BackendError::creation(KIND, err))
    }

    /// Stamps of every domain cloned from the base, in listing order.
    async fn stamped_domains(&self) -> Result<Vec<(String, Stamp)>, ExecError> {
        let listing = self.virsh_output(&["list", "--all", "--name"]).await?;
        let prefix = format!("{}-", self.spec.base_domain);
        let mut stamped = Vec::new();
        for domain in listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&prefix))
        {
            let description = self.virsh_output(&["desc", domain]).await?;
            if let Some(stamp) = Stamp::parse(&description.stdout) {
                stamped.push((domain.to_owned(), stamp));
            }
        }
        Ok(stamped)
    }

    /// Undefines an image and deletes the disks it is made of.
    async fn remove_image(&self, image: &str) -> Result<(), ExecError> {
        let listing = self
            .virsh_output(&["domblklist", image, "--details"])
            .await?;
        self.virsh_output(&["undefine", image, "--managed-save", "--snapshots-metadata"])
            .await?;
        for disk in parse_domblklist(&listing.stdout) {
            self.virsh_output(&["vol-delete", &disk.source]).await?;
        }
        Ok(())
    }

    /// Stops and undefines the clone, then deletes its overlays.
    ///
    /// Overlays are deleted even when the domain is already gone, so a
    /// retry after a failed volume deletion still frees the disk space.
    /// Reports [`BackendError::Gone`] only when neither the domain nor any
    /// overlay was left.
    async fn remove_clone(&self, clone: &str, overlays: &[(String, String)]) -> Result<(), BackendError> {
        let destroy_error = |err: ExecError| BackendError::destroy(KIND, clone, err);

        let state = self.virsh().arg("domstate").arg(clone);
        let output = self.runner.run(&state).await.map_err(destroy_error)?;
        let domain_present = !output.stderr.contains(MISSING_DOMAIN);
        if domain_present {
            if output.first_line() == Some("running") {
                self.virsh_output(&["destroy", clone])
                    .await
                    .map_err(destroy_error)?;
            }
            self.virsh_output(&["undefine", clone, "--managed-save", "--snapshots-metadata"])
                .await
                .map_err(destroy_error)?;
        }
        let deleted = self.delete_overlays(overlays).await.map_err(destroy_error)?;
        if !domain_present && deleted == 0 {
            return Err(BackendError::Gone {
                kind: KIND,
                id: clone.to_owned(),
            });
        }
        Ok(())
    }

    /// Deletes overlay volumes, skipping ones that no longer exist, and
    /// returns how many were deleted.
    async fn delete_overlays(&self, overlays: &[(String, String)]) -> Result<usize, ExecError> {
        let mut deleted = 0_usize;
        for (pool, name) in overlays {
            let command = self
                .virsh()
                .arg("vol-delete")
                .arg("--pool")
                .arg(pool)
                .arg(name);
            let output = self.runner.run(&command).await?;
            if output.is_success() {
                deleted = deleted.saturating_add(1);
            } else if output.stderr.contains(MISSING_VOLUME) {
                debug!(pool = %pool, volume = %name, "overlay already deleted");
            } else {
                return Err(ExecError::failure(&self.tools.virsh, &output));
            }
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for LibvirtDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtDriver")
            .field("spec", &self.spec)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Backend for LibvirtDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(self.clone_domain(&self.spec.base_domain, None))
    }

    fn address<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move {
            let output = self
                .virsh_output(&["domiflist", &handle.id])
                .await
                .map_err(|err| BackendError::address(KIND, &handle.id, err))?;
            let interfaces = parse_domiflist(&output.stdout);
            let chosen = match &self.spec.network {
                Some(network) => interfaces.iter().find(|iface| &iface.source == network),
                None => interfaces.first(),
            };
            chosen
                .map(|iface| AddressSource::Lookup {
                    key: iface.mac.clone(),
                })
                .ok_or_else(|| {
                    BackendError::address(
                        KIND,
                        &handle.id,
                        format!(
                            "no interface attached to network {}",
                            self.spec.network.as_deref().unwrap_or("<any>")
                        ),
                    )
                })
        })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let overlays = handle
                .metadata
                .get(OVERLAYS_KEY)
                .map(|value| Overlay::decode(value))
                .unwrap_or_default();
            self.remove_clone(&handle.id, &overlays).await?;
            info!(clone = %handle.id, "removed clone and overlays");
            Ok(())
        })
    }

    fn provision_reuse(&self) -> ProvisionReuse<'_> {
        ProvisionReuse::Images(self)
    }
}

impl ImageCache for LibvirtDriver {
    fn find<'a>(&'a self, cache_key: &'a str, tag: &'a str) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let stamped = self
                .stamped_domains()
                .await
                .map_err(|err| BackendError::creation(KIND, err))?;
            let mut found = None;
            for (domain, stamp) in &stamped {
                let Stamp::Image { key, tag: stamped_tag } = stamp else {
                    continue;
                };
                if key != cache_key {
                    continue;
                }
                if stamped_tag == tag {
                    if found.is_none() {
                        found = Some(domain.clone());
                    }
                    continue;
                }
                let in_use = stamped.iter().any(|(_, other)| {
                    matches!(other, Stamp::Clone { image } if image == domain)
                });
                if in_use {
                    info!(image = %domain, "stale image still backs a clone; keeping it");
                } else if let Err(err) = self.remove_image(domain).await {
                    warn!(image = %domain, error = %err, "could not remove stale image");
                } else {
                    info!(image = %domain, tag = %stamped_tag, "removed stale image");
                }
            }
            Ok(found)
        })
    }

    fn capture<'a>(
        &'a self,
        instance: &'a InstanceHandle,
        cache_key: &'a str,
        tag: &'a str,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let domain = instance.id.as_str();
            self.virsh_output(&["shutdown", domain])
                .await
                .map_err(|err| BackendError::creation(KIND, err))?;
            self.wait_for_state(domain, "shut off").await?;
            let stamp = Stamp::Image {
                key: cache_key.to_owned(),
                tag: tag.to_owned(),
            };
            self.write_stamp(domain, &stamp).await?;
            info!(image = domain, tag, "kept provisioned clone as image");
            Ok(domain.to_owned())
        })
    }

    fn create_from<'a>(&'a self, image: &'a str) -> BackendFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let stamp = Stamp::Clone {
                image: image.to_owned(),
            };
            self.clone_domain(image, Some(&stamp)).await
        })
    }
}

#[cfg(test)]
mod tests;
