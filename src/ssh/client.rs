use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use super::cloud_init::remove_useless_lines_from_cloud_init_output;
use super::transport::CommandRunner;
use super::{
    Input, InstallImageState, Output, SshClient, SshClientFactory, SshError, SshErrorKind,
};
use crate::config::Settings;

const DETECT_LINUX_ON_ANOTHER_DISK: &str = include_str!("scripts/detect-linux-on-another-disk.sh");
const WIPE_DISK: &str = include_str!("scripts/wipe-disk.sh");
const CHECK_DISK: &str = include_str!("scripts/check-disk.sh");
const NIC_INFO: &str = include_str!("scripts/nic-info.sh");
const DOWNLOAD_FROM_OCI: &str = include_str!("scripts/download-from-oci.sh");

pub(crate) const WWN_PATTERN: &str = r"^[0-9a-zA-Z._=:-]{5,64}$";

// Seen in the wild: 10:00:00:05:1e:7a:7a:00 eui.00253885910c8cec 0x500a07511bb48b25
static WWN_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(WWN_PATTERN).ok());

/// WWNs end up in remote shell commands and must stay within a strict character set.
pub fn is_valid_wwn(wwn: &str) -> bool {
    WWN_REGEX.as_ref().is_some_and(|re| re.is_match(wwn))
}

/// Client for one host, backed by a [`CommandRunner`]
pub struct RemoteClient {
    runner: Arc<dyn CommandRunner>,
    input: Input,
    oci_registry_auth_token: String,
    installimage_tgz_path: PathBuf,
}

impl RemoteClient {
    pub fn new(runner: Arc<dyn CommandRunner>, input: Input, settings: &Settings) -> Self {
        Self {
            runner,
            input,
            oci_registry_auth_token: settings.oci_registry_auth_token.clone(),
            installimage_tgz_path: settings.installimage_tgz_path.clone(),
        }
    }

    async fn run(&self, command: &str) -> Output {
        self.runner.run(&self.input, command).await
    }

    async fn run_script(&self, file_name: &str, script: &str, wwns: &[String]) -> Output {
        self.run(&format!(
            "cat >/root/{file_name} <<'EOF_VIA_SSH'\n{script}\nEOF_VIA_SSH\nchmod a+rx /root/{file_name}\n/root/{file_name} {}\n",
            wwns.join(" ")
        ))
        .await
    }

    /// Upload a local file by piping it through base64.
    async fn upload(&self, data: &[u8], dest: &str, mode: &str) -> Output {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.run(&format!(
            "echo {encoded} | base64 -d > '{dest}' && chmod {mode} '{dest}'"
        ))
        .await
    }
}

/// WWNs end up in a shell command line, reject anything outside the WWN charset first.
fn check_wwns(wwns: &[String]) -> Result<(), SshError> {
    match wwns.iter().find(|w| !is_valid_wwn(w)) {
        Some(bad) => Err(SshError::new(
            SshErrorKind::InvalidWwn,
            format!("WWN {bad:?} is invalid"),
        )),
        None => Ok(()),
    }
}

fn ok_or_stderr(out: &Output) -> bool {
    out.err.is_none() && out.stderr.is_empty()
}

#[async_trait]
impl SshClient for RemoteClient {
    async fn get_hostname(&self) -> Output {
        self.run("hostname").await
    }

    async fn get_hardware_details_ram(&self) -> Output {
        self.run("grep MemTotal /proc/meminfo | awk '{print $2}'").await
    }

    async fn get_hardware_details_nics(&self) -> Output {
        self.run(&format!(
            "cat >/root/nic-info.sh <<'EOF_VIA_SSH'\n{NIC_INFO}\nEOF_VIA_SSH\nchmod a+rx /root/nic-info.sh\n/root/nic-info.sh\n"
        ))
        .await
    }

    async fn get_hardware_details_storage(&self) -> Output {
        self.run(r#"lsblk -b -P -o "NAME,TYPE,SIZE,VENDOR,MODEL,SERIAL,WWN,HCTL,ROTA""#)
            .await
    }

    async fn get_hardware_details_cpu_arch(&self) -> Output {
        self.run(r#"lscpu | grep "Architecture:" | awk '{print $2}'"#)
            .await
    }

    async fn get_hardware_details_cpu_model(&self) -> Output {
        self.run(r#"lscpu | grep "Model name:" | awk '{$1=$2=""; print $0}' | sed "s/^[ \t]*//""#)
            .await
    }

    async fn get_hardware_details_cpu_clock_gigahertz(&self) -> Output {
        self.run(r#"lscpu | grep "CPU max MHz:" |  awk '{printf "%.1f", $4/1000}'"#)
            .await
    }

    async fn get_hardware_details_cpu_flags(&self) -> Output {
        self.run(r#"lscpu | grep "Flags:" |  awk '{ $1=""; print $0}' | sed "s/^[ \t]*//""#)
            .await
    }

    async fn get_hardware_details_cpu_threads(&self) -> Output {
        self.run(r#"lscpu | grep "CPU(s):" | head -1 |  awk '{ print $2}'"#)
            .await
    }

    async fn get_hardware_details_cpu_cores(&self) -> Output {
        self.run(r#"grep 'cpu cores' /proc/cpuinfo | uniq | awk '{print $4}'"#)
            .await
    }

    async fn get_hardware_details_debug(&self) -> Output {
        self.run(
            "ip a; echo ==========----------==========;\n\tethtool \"*\"; echo ==========----------==========;\n\tlspci; echo ==========----------==========;\n\t",
        )
        .await
    }

    async fn get_install_image_state(&self) -> Result<InstallImageState, SshError> {
        let out = self.run("ps aux| grep installimage | grep -v grep; true").await;
        if let Some(err) = out.err {
            return Err(err.wrap(
                "failed to run `ps aux` to get running installimage process",
            ));
        }
        if !out.stdout.is_empty() {
            return Ok(InstallImageState::Running);
        }

        let out = self.run("[ -e /root/installimage-wrapper.sh.log ]").await;
        let status = out.exit_status().map_err(|e| {
            e.wrap("failed to check if installimage-wrapper.sh.log exists")
        })?;
        if status == 0 {
            // log exists but no process is left
            return Ok(InstallImageState::Finished);
        }
        Ok(InstallImageState::NotStartedYet)
    }

    async fn get_result_of_install_image(&self) -> Result<String, SshError> {
        let out = self.run("cat /root/debug.txt").await;
        if let Some(err) = out.err {
            return Err(err.wrap("failed to get debug.txt"));
        }
        let debug_txt = out.stdout;

        let out = self.run("cat /root/installimage-wrapper.sh.log").await;
        if let Some(err) = out.err {
            return Err(err.wrap("failed to get installimage-wrapper.sh.log"));
        }
        let wrapper_log = out.stdout;

        Ok(format!(
            "debug.txt:\n{debug_txt}\n\n######################################\n\n/root/installimage-wrapper.sh stdout+stderr:\n\n{wrapper_log}\n"
        ))
    }

    async fn get_cloud_init_output(&self) -> Output {
        let mut out = self.run("cat /var/log/cloud-init-output.log").await;
        if out.err.is_none() {
            out.stdout = remove_useless_lines_from_cloud_init_output(&out.stdout);
        }
        out
    }

    async fn create_auto_setup(&self, data: String) -> Output {
        self.run(&format!(
            "cat << 'EOF_VIA_SSH' > /autosetup\n{data}\nEOF_VIA_SSH"
        ))
        .await
    }

    async fn download_image(&self, path: String, url: String) -> Output {
        match url.strip_prefix("oci://") {
            None => {
                self.run(&format!(r#"curl -sLo "{path:?}" "{url:?}""#))
                    .await
            }
            Some(image) => {
                self.run(&format!(
                    "cat << 'ENDOFSCRIPT' > /root/download-from-oci.sh\n{DOWNLOAD_FROM_OCI}\nENDOFSCRIPT\nchmod a+rx /root/download-from-oci.sh\nOCI_REGISTRY_AUTH_TOKEN={} /root/download-from-oci.sh {image} {path}",
                    self.oci_registry_auth_token
                ))
                .await
            }
        }
    }

    async fn create_post_install_script(&self, data: String) -> Output {
        let out = self
            .run(&format!(
                "cat << 'EOF_VIA_SSH' > /root/post-install.sh\n{data}\nEOF_VIA_SSH"
            ))
            .await;
        if !ok_or_stderr(&out) {
            return out;
        }
        self.run("chmod +x /root/post-install.sh").await
    }

    async fn execute_install_image(&self, has_post_install_script: bool) -> Output {
        let cmd = if has_post_install_script {
            "/root/hetzner-installimage/installimage -a -c /autosetup -x /root/post-install.sh"
        } else {
            "/root/hetzner-installimage/installimage -a -c /autosetup"
        };

        let out = self
            .run(&format!(
                "cat << 'EOF_VIA_SSH' > /root/installimage-wrapper.sh\n#!/bin/bash\nexport TERM=xterm\n\n# don't wait 20 seconds before starting: echo \"x\"\necho \"x\" | {cmd}\nEOF_VIA_SSH"
            ))
            .await;
        if !ok_or_stderr(&out) {
            return out;
        }

        let out = self.run("chmod +x /root/installimage-wrapper.sh . ").await;
        if !ok_or_stderr(&out) {
            return out;
        }

        self.run(
            "nohup /root/installimage-wrapper.sh >/root/installimage-wrapper.sh.log 2>&1 </dev/null &",
        )
        .await
    }

    async fn reboot(&self) -> Output {
        let out = self.run("reboot").await;
        // the session dies with the machine
        if out.err_is(&SshErrorKind::ExitedWithoutStatus) {
            return Output::default();
        }
        out
    }

    async fn cloud_init_status(&self) -> Output {
        let out = self.run("cloud-init status").await;
        if out.err_is(&SshErrorKind::ExitStatus(1)) {
            return Output::stdout("status: error");
        }
        out
    }

    async fn check_cloud_init_logs_for_sigterm(&self) -> Output {
        let out = self
            .run(r#"cat /var/log/cloud-init.log | grep "SIGTERM""#)
            .await;
        // grep found nothing
        if out.err_is(&SshErrorKind::ExitStatus(1)) {
            return Output::default();
        }
        out
    }

    async fn clean_cloud_init_logs(&self) -> Output {
        self.run("cloud-init clean --logs").await
    }

    async fn clean_cloud_init_instances(&self) -> Output {
        self.run("rm -rf /var/lib/cloud/instances").await
    }

    async fn reset_kubeadm(&self) -> Output {
        // falls back to stopping pods and kubelet explicitly when kubeadm reset fails
        self.run(
            r#"kubeadm reset -f 2>&1
	echo
	echo ========= stopping all pods =========
	crictl pods -q | while read -r podid; do
      crictl stopp "$podid"
    done
	echo
	echo ========= disabling kubelet =========
	systemctl disable --now kubelet
	echo
	echo ========= deleting directories =========
	rm -rf /etc/kubernetes /var/run/kubeadm /var/lib/etcd
	echo ========= done =========
"#,
        )
        .await
    }

    async fn untar_tgz(&self) -> Output {
        let data = match tokio::fs::read(&self.installimage_tgz_path).await {
            Ok(data) => data,
            Err(e) => {
                return Output::from_err(SshError::new(
                    SshErrorKind::Other,
                    format!(
                        "ReadInstallimageTgzFailed {}: {e}",
                        self.installimage_tgz_path.display()
                    ),
                ))
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.run(&format!("echo {encoded} | base64 -d | tar -xzf-"))
            .await
    }

    async fn detect_linux_on_another_disk(&self, wwns: Vec<String>) -> Output {
        if let Err(err) = check_wwns(&wwns) {
            return Output::from_err(err);
        }
        self.run_script(
            "detect-linux-on-another-disk.sh",
            DETECT_LINUX_ON_ANOTHER_DISK,
            &wwns,
        )
        .await
    }

    async fn wipe_disk(&self, wwns: Vec<String>) -> Result<String, SshError> {
        if wwns.is_empty() {
            return Ok(String::new());
        }
        let wwns = if wwns.iter().any(|w| w == "all") {
            let out = self
                .run("lsblk --nodeps --noheadings -o WWN | sort -u")
                .await;
            if let Some(err) = out.err {
                return Err(err.wrap("failed to find WWNs of all disks"));
            }
            let found: Vec<String> = out.stdout.split_whitespace().map(String::from).collect();
            info!(wwns = ?found, "WipeDisk: 'all' was given. Found these WWNs");
            found
        } else {
            wwns
        };
        check_wwns(&wwns)?;

        let out = self.run_script("wipe-disk.sh", WIPE_DISK, &wwns).await;
        if let Some(err) = out.err.clone() {
            return Err(err.wrap(format!(
                "WipeDisk for {wwns:?} failed: {}. {}",
                out.stdout, out.stderr
            )));
        }
        Ok(out.to_string())
    }

    async fn check_disk(&self, wwns: Vec<String>) -> Result<String, SshError> {
        if wwns.is_empty() {
            return Ok(String::new());
        }
        check_wwns(&wwns)?;
        let out = self.run_script("check-disk.sh", CHECK_DISK, &wwns).await;
        let status = out
            .exit_status()
            .map_err(|e| e.wrap(format!("CheckDisk for {wwns:?} failed")))?;
        match status {
            0 => Ok(out.to_string()),
            1 => Err(SshError::new(
                SshErrorKind::BrokenDisk,
                format!(
                    "CheckDisk for {wwns:?} failed: {}. {}",
                    out.stdout.trim(),
                    out.stderr.trim()
                ),
            )),
            // e.g. unknown WWN
            _ => Err(SshError::new(
                SshErrorKind::ExitStatus(status),
                format!(
                    "CheckDisk for {wwns:?} failed: {}. {}",
                    out.stdout.trim(),
                    out.stderr.trim()
                ),
            )),
        }
    }

    async fn execute_pre_provision_command(
        &self,
        command: String,
    ) -> Result<(u32, String), SshError> {
        let data = tokio::fs::read(&command).await.map_err(|e| {
            SshError::new(SshErrorKind::Other, format!("error opening file {command:?}: {e}"))
        })?;
        let base_name = Path::new(&command)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "pre-provision-command".to_string());
        let dest = format!("/root/{base_name}");

        let out = self.upload(&data, &dest, "0700").await;
        if let Some(err) = out.err {
            return Err(err.wrap(format!(
                "error copying file {command:?} to {}:{}:{dest}",
                self.input.ip, self.input.port
            )));
        }

        let out = self.run(&format!("'{dest}'")).await;
        let status = out.exit_status().map_err(|e| {
            e.wrap(format!(
                "error executing {dest:?} on {}:{}",
                self.input.ip, self.input.port
            ))
        })?;
        let combined = [out.stdout.trim(), out.stderr.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        Ok((status, combined))
    }
}

/// Hands out [`RemoteClient`]s sharing one transport
pub struct RemoteClientFactory {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
}

impl RemoteClientFactory {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Self { runner, settings }
    }
}

impl SshClientFactory for RemoteClientFactory {
    fn new_client(&self, input: Input) -> Box<dyn SshClient> {
        Box::new(RemoteClient::new(self.runner.clone(), input, &self.settings))
    }
}
