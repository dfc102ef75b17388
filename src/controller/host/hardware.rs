//! Hardware inventory of a host booted into the rescue system

use serde::Deserialize;

use crate::crd::{Cpu, HardwareDetails, Nic, Storage};
use crate::error::{Error, Result};
use crate::ssh::{Output, SshClient, SshError, SshErrorKind};

const KIBI_TO_MEBI: i64 = 1024;
const GB_TO_MEBI: i64 = 1000;
const GB_TO_BYTES: i64 = 1_000_000 * GB_TO_MEBI;

pub(crate) fn trim_line_break(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

/// Turn `key1="a" key2="b"` into a JSON object.
pub fn valid_json_from_ssh_output(line: &str) -> String {
    if line.is_empty() {
        return "{}".to_string();
    }
    let line = line.replace("\" ", "\",\"").replace("=\"", "\":\"");
    format!("{{\"{}}}", line.trim())
}

/// Fail on transport errors and on anything written to stderr.
pub(crate) fn check_ssh_output(out: &Output) -> Result<()> {
    if let Some(err) = &out.err {
        return Err(Error::SshError(err.clone().wrap(format!(
            "failed to perform ssh command: stdout {:?}. stderr {:?}",
            out.stdout, out.stderr
        ))));
    }
    if !out.stderr.is_empty() {
        return Err(Error::ReconcileError(format!(
            "ssh cmd returned non-empty StdErr: StdErr: {}",
            out.stderr
        )));
    }
    Ok(())
}

fn non_empty_stdout(out: &Output) -> Result<&str> {
    check_ssh_output(out)?;
    let stdout = trim_line_break(&out.stdout);
    if stdout.is_empty() {
        return Err(SshError::from_kind(SshErrorKind::EmptyStdOut).into());
    }
    Ok(stdout)
}

fn parse_int(value: &str, what: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|e| {
        Error::ValidationError(format!("failed to parse {what} from {value:?}: {e}"))
    })
}

/// `MemTotal` in KiB to MiB
pub(crate) fn parse_ram_mebibytes(stdout: &str) -> Result<i64> {
    Ok(parse_int(stdout, "memory")? / KIBI_TO_MEBI)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNic {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    speed_mbps: String,
}

pub(crate) fn parse_nics(stdout: &str) -> Result<Vec<Nic>> {
    stdout
        .lines()
        .map(|line| {
            let json = valid_json_from_ssh_output(line);
            let raw: RawNic = serde_json::from_str(&json).map_err(|e| {
                Error::ValidationError(format!(
                    "failed to unmarshal {json}. Original ssh output {stdout}: {e}"
                ))
            })?;
            Ok(Nic {
                speed_mbps: parse_int(&raw.speed_mbps, "nic speed")?,
                name: raw.name,
                model: raw.model,
                mac: raw.mac,
                ip: raw.ip,
            })
        })
        .collect()
}

/// One line of `lsblk -b -P`
#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct RawBlockDevice {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "TYPE")]
    type_: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    serial: String,
    #[serde(default)]
    wwn: String,
    #[serde(default)]
    hctl: String,
    #[serde(default)]
    rota: String,
}

/// Disks from `lsblk` output, partitions and other device types are skipped.
pub(crate) fn parse_storage(stdout: &str) -> Result<Vec<Storage>> {
    let mut disks = Vec::new();
    for line in stdout.lines() {
        let json = valid_json_from_ssh_output(line);
        let raw: RawBlockDevice = serde_json::from_str(&json).map_err(|e| {
            Error::ValidationError(format!(
                "failed to unmarshal {json}. Original ssh output {stdout}: {e}"
            ))
        })?;
        let size_bytes = parse_int(&raw.size, "storage size")?;
        let rota = match raw.rota.as_str() {
            "1" => true,
            "0" => false,
            other => {
                return Err(Error::ValidationError(format!(
                    "unknown rota: Got {other}. Expect either 1 or 0"
                )))
            }
        };
        if raw.type_ != "disk" {
            continue;
        }
        disks.push(Storage {
            name: raw.name,
            size_bytes,
            size_gb: size_bytes / GB_TO_BYTES,
            vendor: raw.vendor.trim().to_string(),
            model: raw.model,
            serial_number: raw.serial,
            wwn: raw.wwn,
            hctl: raw.hctl,
            rota,
        });
    }
    Ok(disks)
}

pub(crate) async fn obtain_storage(client: &dyn SshClient) -> Result<Vec<Storage>> {
    let out = client.get_hardware_details_storage().await;
    parse_storage(non_empty_stdout(&out)?)
}

async fn obtain_cpu(client: &dyn SshClient) -> Result<Cpu> {
    let arch = client.get_hardware_details_cpu_arch().await;
    let arch = non_empty_stdout(&arch)
        .map_err(|e| e.context("failed to get CPU arch"))?
        .to_string();

    let model = client.get_hardware_details_cpu_model().await;
    let model = non_empty_stdout(&model)
        .map_err(|e| e.context("failed to get CPU model"))?
        .to_string();

    let clock = client.get_hardware_details_cpu_clock_gigahertz().await;
    let clock_gigahertz = non_empty_stdout(&clock)
        .map_err(|e| e.context("failed to get CPU clock speed"))?
        .to_string();

    let threads = client.get_hardware_details_cpu_threads().await;
    let threads = non_empty_stdout(&threads)
        .and_then(|s| parse_int(s, "cpu threads"))
        .map_err(|e| e.context("failed to get CPU threads"))?;

    let flags = client.get_hardware_details_cpu_flags().await;
    let flags = non_empty_stdout(&flags)
        .map_err(|e| e.context("failed to get CPU flags"))?
        .split(' ')
        .map(String::from)
        .collect();

    Ok(Cpu {
        arch,
        model,
        clock_gigahertz,
        threads,
        flags,
    })
}

/// Query RAM, NICs, disks and CPU over ssh.
pub async fn obtain_hardware_details(client: &dyn SshClient) -> Result<HardwareDetails> {
    let ram = client.get_hardware_details_ram().await;
    let mebibytes = non_empty_stdout(&ram)
        .and_then(parse_ram_mebibytes)
        .map_err(|e| e.context("failed to obtain hardware details RAM"))?;

    let nics = client.get_hardware_details_nics().await;
    let nics = non_empty_stdout(&nics)
        .and_then(parse_nics)
        .map_err(|e| e.context("failed to obtain hardware details Nics"))?;

    let storage = obtain_storage(client)
        .await
        .map_err(|e| e.context("failed to obtain hardware details storage"))?;

    let cpu = obtain_cpu(client)
        .await
        .map_err(|e| e.context("failed to obtain hardware details CPU"))?;

    Ok(HardwareDetails {
        ram_gb: mebibytes / GB_TO_MEBI,
        nics,
        storage,
        cpu,
    })
}

/// Kernel names of the disks whose WWN is listed
pub(crate) fn device_names(wwns: &[String], storage: &[Storage]) -> Vec<String> {
    storage
        .iter()
        .filter(|device| wwns.contains(&device.wwn))
        .map(|device| device.name.clone())
        .collect()
}

/// Every root device WWN must belong to a disk of the host.
pub(crate) fn validate_root_device_wwns(wwns: &[String], storage: &[Storage]) -> Result<()> {
    let known: Vec<&str> = storage.iter().map(|s| s.wwn.as_str()).collect();
    match wwns.iter().find(|wwn| !known.contains(&wwn.as_str())) {
        Some(missing) => Err(Error::ValidationError(format!(
            "missing storage device for root device hint {missing:?}. Known WWNs: {known:?}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_json_from_ssh_output() {
        assert_eq!(
            valid_json_from_ssh_output(r#"key1="string1" key2="string2" key3="string3""#),
            r#"{"key1":"string1","key2":"string2","key3":"string3"}"#
        );
        assert_eq!(valid_json_from_ssh_output(r#"key1="string1""#), r#"{"key1":"string1"}"#);
        assert_eq!(valid_json_from_ssh_output(""), "{}");
    }

    #[test]
    fn test_parse_storage_keeps_disks_only() {
        let stdout = concat!(
            r#"NAME="sda" TYPE="disk" SIZE="3999999999999" VENDOR="ATA     " MODEL="TOSHIBA" SERIAL="X1" WWN="0x5000039a5bd8f7e7" HCTL="0:0:0:0" ROTA="1""#,
            "\n",
            r#"NAME="sda1" TYPE="part" SIZE="1000000000" VENDOR="" MODEL="" SERIAL="" WWN="0x5000039a5bd8f7e7" HCTL="" ROTA="1""#,
            "\n",
            r#"NAME="nvme0n1" TYPE="disk" SIZE="512110190592" VENDOR="" MODEL="SAMSUNG" SERIAL="S4" WWN="eui.0025388b01e4f6a1" HCTL="" ROTA="0""#,
        );
        let disks = parse_storage(stdout).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].vendor, "ATA");
        assert_eq!(disks[0].size_gb, 3999);
        assert!(disks[0].rota);
        assert_eq!(disks[1].name, "nvme0n1");
        assert!(!disks[1].rota);
    }

    #[test]
    fn test_parse_storage_rejects_unknown_rota() {
        let stdout = r#"NAME="sda" TYPE="disk" SIZE="1" VENDOR="" MODEL="" SERIAL="" WWN="" HCTL="" ROTA="x""#;
        assert!(parse_storage(stdout).is_err());
    }

    #[test]
    fn test_parse_nics() {
        let stdout = concat!(
            r#"name="eth0" model="Intel Corporation I210" mac="a8:a1:59:94:19:42" ip="23.88.6.239/26" speedMbps="1000""#,
            "\n",
            r#"name="eth0" model="Intel Corporation I210" mac="a8:a1:59:94:19:42" ip="2a01:4f8:272:3e0f::2/64" speedMbps="1000""#,
        );
        let nics = parse_nics(stdout).unwrap();
        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].speed_mbps, 1000);
        assert_eq!(nics[1].ip, "2a01:4f8:272:3e0f::2/64");
    }

    #[test]
    fn test_ram_is_reported_in_mebibytes() {
        assert_eq!(parse_ram_mebibytes("65536000").unwrap(), 64000);
        assert!(parse_ram_mebibytes("lots").is_err());
    }

    #[test]
    fn test_check_ssh_output() {
        assert!(check_ssh_output(&Output::stdout("ok")).is_ok());
        let with_stderr = Output {
            stderr: "boom".into(),
            ..Default::default()
        };
        assert!(check_ssh_output(&with_stderr)
            .unwrap_err()
            .to_string()
            .contains("StdErr: boom"));
    }

    #[test]
    fn test_root_device_wwns_must_exist() {
        let storage = vec![Storage {
            name: "sda".into(),
            wwn: "0x5000039a5bd8f7e7".into(),
            ..Default::default()
        }];
        assert!(validate_root_device_wwns(&["0x5000039a5bd8f7e7".into()], &storage).is_ok());
        assert!(validate_root_device_wwns(&["0xdeadbeef00".into()], &storage).is_err());
        assert_eq!(
            device_names(&["0x5000039a5bd8f7e7".into()], &storage),
            vec!["sda".to_string()]
        );
    }
}
