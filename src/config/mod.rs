//! Configuration loading.
//!
//! Two layers feed the orchestrator. [`OvercastConfig`] holds process-wide
//! settings (tool paths, SSH client options, file locations) and is loaded via
//! `ortho-config`, which merges defaults, configuration files, and
//! environment variables. [`HostProperties`] holds the per-host
//! `{label}.key` hierarchy read from JSON property files.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::SshSettings;

mod properties;

pub use properties::{HostProperties, PropertyScope};

/// Project-level host property file.
pub const DEFAULT_HOSTS_FILE: &str = "overcast.json";

/// Global settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OVERCAST",
    discovery(
        app_name = "overcast",
        env_var = "OVERCAST_CONFIG_PATH",
        config_file_name = "overcast.toml",
        dotfile_name = ".overcast.toml",
        project_file_name = "overcast.toml"
    )
)]
pub struct OvercastConfig {
    /// Project host property file, read after the user file.
    #[ortho_config(default = DEFAULT_HOSTS_FILE.to_owned())]
    pub hosts_file: String,
    /// User host property file. Supports a leading `~`.
    #[ortho_config(default = "~/.overcast/overcast.json".to_owned())]
    pub user_hosts_file: String,
    /// JSON file recording expiration tags of provisioned images.
    #[ortho_config(default = "~/.overcast/tags.json".to_owned())]
    pub tag_store_path: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sshpass` helper used for password logins.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Whether to enforce host key checking; throwaway hosts change keys on
    /// every run.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Path to the AWS command-line client.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the `vagrant` executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
    /// Path to the `VBoxManage` executable.
    #[ortho_config(default = "VBoxManage".to_owned())]
    pub vboxmanage_bin: String,
    /// Path to the `virsh` executable.
    #[ortho_config(default = "virsh".to_owned())]
    pub virsh_bin: String,
    /// Path to the `virt-clone` executable.
    #[ortho_config(default = "virt-clone".to_owned())]
    pub virt_clone_bin: String,
    /// Path to the `virt-xml` executable.
    #[ortho_config(default = "virt-xml".to_owned())]
    pub virt_xml_bin: String,
}

impl Default for OvercastConfig {
    fn default() -> Self {
        Self {
            hosts_file: DEFAULT_HOSTS_FILE.to_owned(),
            user_hosts_file: String::from("~/.overcast/overcast.json"),
            tag_store_path: String::from("~/.overcast/tags.json"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            aws_bin: String::from("aws"),
            vagrant_bin: String::from("vagrant"),
            vboxmanage_bin: String::from("VBoxManage"),
            virsh_bin: String::from("virsh"),
            virt_clone_bin: String::from("virt-clone"),
            virt_xml_bin: String::from("virt-xml"),
        }
    }
}

impl OvercastConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables without consulting process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("overcast")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Host property files in load order; later files override earlier ones.
    #[must_use]
    pub fn host_property_files(&self) -> Vec<Utf8PathBuf> {
        vec![
            expand_tilde(&self.user_hosts_file),
            expand_tilde(&self.hosts_file),
        ]
    }

    /// Location of the expiration tag store.
    #[must_use]
    pub fn tag_store_file(&self) -> Utf8PathBuf {
        expand_tilde(&self.tag_store_path)
    }

    /// SSH client settings derived from this configuration.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            ..SshSettings::default()
        }
    }
}

/// Expands a leading `~` to the current user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> Utf8PathBuf {
    let home = std::env::var("HOME").ok();
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(dir)) => Utf8PathBuf::from(dir).join(rest),
        _ => Utf8PathBuf::from(path),
    }
}

/// Errors raised while loading or interpreting configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A host property file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File being read.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// A host property file is not valid JSON.
    #[error("invalid host properties in {path}: {message}")]
    Json {
        /// File being parsed.
        path: Utf8PathBuf,
        /// Parser error text.
        message: String,
    },
    /// A required host property is absent or blank.
    #[error("missing required property {key}")]
    MissingKey {
        /// Fully qualified property key.
        key: String,
    },
    /// A property has a value outside its accepted domain.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Fully qualified property key.
        key: String,
        /// Offending value.
        value: String,
        /// What was expected instead.
        reason: String,
    },
    /// None of the backend-selecting properties is set for a host.
    #[error(
        "no backend configured for host {label}: set one of hostname, vagrantDir, amiId, \
         vboxUuid, baseDomain, dockerHost, dockerImage, or vmBaseImage"
    )]
    NoBackend {
        /// Host label.
        label: String,
    },
}

#[cfg(test)]
mod tests;
