//! HetznerBareMetalHost Custom Resource Definition
//!
//! A HetznerBareMetalHost represents one dedicated server rented via the Robot API. Everything the
//! controller learns about the machine lives in `spec.status`, so that a host can be moved between
//! management clusters without losing its provisioning progress.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectRef, SecretReference, SshSecretRef};

/// Finalizer blocking deletion until the host is deprovisioned
pub const BARE_METAL_HOST_FINALIZER: &str = "hetznerbaremetalhost.infrastructure.cluster.x-k8s.io";

/// Set to `{"type":"hw"}` (or another reboot type) to ask for a reboot of a provisioned host.
pub const REBOOT_ANNOTATION: &str = "reboot.hetznerbaremetalhost.infrastructure.cluster.x-k8s.io";

/// Space separated WWNs, or `all`, wiped while the host is registering
pub const WIPE_DISK_ANNOTATION: &str =
    "wipedisk.hetznerbaremetalhost.infrastructure.cluster.x-k8s.io";

/// Set on machines, value is `<namespace>/<name>` of the host they consume
pub const HOST_ANNOTATION: &str = "infrastructure.cluster.x-k8s.io/HetznerBareMetalHost";

/// Hostname of the Hetzner rescue system
pub const RESCUE_HOSTNAME: &str = "rescue";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "HetznerBareMetalHost",
    namespaced,
    shortname = "hbmh",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.status.provisioningState"}"#,
    printcolumn = r#"{"name":"ServerID","type":"integer","jsonPath":".spec.serverID"}"#,
    printcolumn = r#"{"name":"Maintenance","type":"boolean","jsonPath":".spec.maintenanceMode"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".spec.status.errorType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalHostSpec {
    /// Server number in the Robot API
    #[serde(rename = "serverID")]
    pub server_id: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device_hints: Option<RootDeviceHints>,

    /// Machine using this host. Empty means the host is free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ObjectRef>,

    /// Hosts in maintenance mode are not remediated and not handed to new machines
    #[serde(default)]
    pub maintenance_mode: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Written by the controller only
    #[serde(default)]
    pub status: ControllerGeneratedStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerGeneratedStatus {
    #[serde(default)]
    pub provisioning_state: ProvisioningState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_image: Option<InstallImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_spec: Option<SshSpec>,

    #[serde(default)]
    pub error_type: ErrorType,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_count: i32,

    /// RFC 3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "hardwareDetails")]
    pub hardware_details: Option<HardwareDetails>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv6: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reboot_types: Vec<RebootType>,

    /// A reboot requested via annotation was triggered and is awaited
    #[serde(default)]
    pub rebooted: bool,

    #[serde(default)]
    pub ssh_status: SshStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Provisioning states, in the order a host passes through them
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ProvisioningState {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "unmanaged")]
    Unmanaged,
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "registering")]
    Registering,
    #[serde(rename = "image-installing")]
    ImageInstalling,
    /// Removed state, treated as `image-installing`
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "ensure-provisioned")]
    EnsureProvisioned,
    #[serde(rename = "provisioned")]
    Provisioned,
    #[serde(rename = "deprovisioning")]
    Deprovisioning,
    #[serde(rename = "deleting")]
    Deleting,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Unmanaged => "unmanaged",
            Self::Preparing => "preparing",
            Self::Registering => "registering",
            Self::ImageInstalling => "image-installing",
            Self::Provisioning => "provisioning",
            Self::EnsureProvisioned => "ensure-provisioned",
            Self::Provisioned => "provisioned",
            Self::Deprovisioning => "deprovisioning",
            Self::Deleting => "deleting",
        }
    }

    /// `image-installing` becomes `ImageInstalling`, used in event reasons
    pub fn upper_camel_case(&self) -> String {
        self.as_str()
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect()
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of the error recorded on a host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorType {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "ssh reboot triggered")]
    SshRebootTriggered,
    #[serde(rename = "software reboot triggered")]
    SoftwareRebootTriggered,
    #[serde(rename = "hardware reboot triggered")]
    HardwareRebootTriggered,
    #[serde(rename = "connection error")]
    ConnectionError,
    #[serde(rename = "provisioned registration error")]
    ProvisionedRegistrationError,
    #[serde(rename = "registration error")]
    RegistrationError,
    #[serde(rename = "preparation error")]
    PreparationError,
    #[serde(rename = "provisioning error")]
    ProvisioningError,
    /// Needs a human, the host is not touched until the error is cleared
    #[serde(rename = "fatal error")]
    FatalError,
    /// Cannot be resolved by the controller at all
    #[serde(rename = "permanent error")]
    PermanentError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::SshRebootTriggered => "ssh reboot triggered",
            Self::SoftwareRebootTriggered => "software reboot triggered",
            Self::HardwareRebootTriggered => "hardware reboot triggered",
            Self::ConnectionError => "connection error",
            Self::ProvisionedRegistrationError => "provisioned registration error",
            Self::RegistrationError => "registration error",
            Self::PreparationError => "preparation error",
            Self::ProvisioningError => "provisioning error",
            Self::FatalError => "fatal error",
            Self::PermanentError => "permanent error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reboot methods offered by the Robot API, plus a reboot issued over ssh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RebootType {
    #[serde(rename = "power")]
    Power,
    #[serde(rename = "sw")]
    Software,
    #[serde(rename = "hw")]
    Hardware,
    #[serde(rename = "man")]
    Manual,
    #[serde(rename = "ssh")]
    Ssh,
}

impl RebootType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Software => "sw",
            Self::Hardware => "hw",
            Self::Manual => "man",
            Self::Ssh => "ssh",
        }
    }

    pub fn verbose(&self) -> &'static str {
        match self {
            Self::Power => "Power",
            Self::Software => "Software",
            Self::Hardware => "Hardware",
            Self::Manual => "Manual",
            Self::Ssh => "SSH",
        }
    }
}

impl fmt::Display for RebootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of [`REBOOT_ANNOTATION`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootAnnotationArguments {
    #[serde(rename = "type")]
    pub type_: RebootType,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RootDeviceHints {
    /// Single disk the image is installed on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wwn: String,
    #[serde(default)]
    pub raid: Raid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Raid {
    /// Disks of a software RAID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wwn: Vec<String>,
}

impl RootDeviceHints {
    /// Empty string when the hints are usable.
    pub fn is_valid_with_message(&self) -> String {
        match (self.wwn.is_empty(), self.raid.wwn.is_empty()) {
            (true, true) => "rootDeviceHints.wwn and rootDeviceHints.raid.wwn are empty. Please specify one or the other.".to_string(),
            (false, false) => "only one of rootDeviceHints.wwn and rootDeviceHints.raid.wwn are allowed.".to_string(),
            _ => String::new(),
        }
    }

    pub fn list_of_wwn(&self) -> Vec<String> {
        if !self.wwn.is_empty() {
            return vec![self.wwn.clone()];
        }
        self.raid.wwn.clone()
    }
}

/// Settings for installimage on the rescue system
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallImage {
    pub image: Image,
    #[serde(default)]
    pub partitions: Vec<Partition>,
    #[serde(default, rename = "logicalVolumeDefinitions", skip_serializing_if = "Vec::is_empty")]
    pub lvm_definitions: Vec<Lvm>,
    #[serde(default, rename = "btrfsDefinitions", skip_serializing_if = "Vec::is_empty")]
    pub btrfs_definitions: Vec<Btrfs>,
    /// 1 enables software RAID
    #[serde(default)]
    pub swraid: i32,
    #[serde(default = "default_swraid_level")]
    pub swraid_level: i32,
    /// Executed by installimage in the chroot of the new OS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_install_script: String,
}

fn default_swraid_level() -> i32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Remote image, `oci://` or http(s)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// File name used for a downloaded image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Image already present on the rescue system
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

const IMAGE_SUFFIXES: [&str; 8] = [
    "tar.gz", "tar.bz2", "tar.bz", "tar.xz", "tgz", "tbz", "txz", "tar",
];

impl Image {
    /// Where the image lives on the rescue system and whether it has to be downloaded first.
    pub fn details(&self) -> Result<(String, bool), String> {
        if !self.name.is_empty() && !self.url.is_empty() {
            let suffix = image_suffix(&self.url).ok_or_else(|| "wrong image url suffix".to_string())?;
            return Ok((format!("/root/{}.{suffix}", self.name), true));
        }
        if !self.path.is_empty() {
            return Ok((self.path.clone(), false));
        }
        Err("invalid image - need to specify either name and url or path".to_string())
    }
}

fn image_suffix(url: &str) -> Option<&'static str> {
    if url.starts_with("oci://") {
        return Some("tgz");
    }
    IMAGE_SUFFIXES.iter().copied().find(|s| url.ends_with(s))
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} ({})", self.name, self.url)
        } else {
            f.write_str(&self.path)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// e.g. `/boot` or `lvm:vg0`
    pub mount: String,
    pub file_system: String,
    /// e.g. `512M`, `all`
    pub size: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lvm {
    pub volume_group: String,
    pub name: String,
    pub mount: String,
    pub file_system: String,
    pub size: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Btrfs {
    pub volume: String,
    pub subvolume: String,
    pub mount: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshSpec {
    /// Key pair used to log into the installed OS
    pub secret_ref: SshSecretRef,
    #[serde(default = "default_ssh_port")]
    pub port_after_install_image: i32,
    #[serde(default = "default_ssh_port")]
    pub port_after_cloud_init: i32,
}

fn default_ssh_port() -> i32 {
    22
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_key: Option<SshKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescue_key: Option<SshKey>,
    /// SHA-256 of the OS secret data last seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_os: Option<String>,
    /// SHA-256 of the rescue secret data last seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rescue: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshKey {
    pub name: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    #[serde(rename = "ramGB")]
    pub ram_gb: i64,
    #[serde(default)]
    pub nics: Vec<Nic>,
    #[serde(default)]
    pub storage: Vec<Storage>,
    #[serde(default)]
    pub cpu: Cpu,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    pub name: String,
    /// Vendor and product id, e.g. `0x8086 0x1572`
    pub model: String,
    pub mac: String,
    pub ip: String,
    pub speed_mbps: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Kernel name, may change across reboots
    pub name: String,
    pub size_bytes: i64,
    #[serde(rename = "sizeGB")]
    pub size_gb: i64,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub wwn: String,
    pub hctl: String,
    /// Spinning disk
    pub rota: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub arch: String,
    pub model: String,
    pub clock_gigahertz: String,
    pub threads: i64,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl HetznerBareMetalHost {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(annotations) = self.metadata.annotations.as_mut() {
            annotations.remove(key);
        }
    }

    pub fn has_reboot_annotation(&self) -> bool {
        self.annotation(REBOOT_ANNOTATION).is_some()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == BARE_METAL_HOST_FINALIZER))
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != BARE_METAL_HOST_FINALIZER);
        }
    }

    /// Record an error. Repeating the same error type counts up, a new type restarts at one.
    pub fn set_error(&mut self, error_type: ErrorType, message: impl Into<String>) {
        let status = &mut self.spec.status;
        if status.error_type == error_type {
            status.error_count += 1;
        } else {
            status.error_type = error_type;
            status.error_count = 1;
        }
        status.error_message = message.into();
    }

    pub fn clear_error(&mut self) {
        let status = &mut self.spec.status;
        if status.error_type != ErrorType::None || !status.error_message.is_empty() {
            status.error_type = ErrorType::None;
            status.error_message.clear();
            status.error_count = 0;
        }
    }

    /// Address used for ssh, the IPv4 address if the server has one
    pub fn ip_address(&self) -> &str {
        if self.spec.status.ipv4.is_empty() {
            &self.spec.status.ipv6
        } else {
            &self.spec.status.ipv4
        }
    }
}
