//! installimage configuration rendered from the host's install image settings

use crate::crd::InstallImage;

/// Per host values merged into the autosetup file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AutoSetupInput {
    /// Kernel names of the target disks, e.g. `nvme0n1`
    pub os_devices: Vec<String>,
    pub hostname: String,
    /// Image path on the rescue system
    pub image: String,
}

/// Render the autosetup file read by installimage.
pub(crate) fn build_auto_setup(install_image: &InstallImage, input: &AutoSetupInput) -> String {
    let drives = input
        .os_devices
        .iter()
        .enumerate()
        .map(|(i, device)| format!("DRIVE{} /dev/{device}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    let mut hostname = format!(
        "\nHOSTNAME {}\nSWRAID {}",
        input.hostname, install_image.swraid
    );
    if install_image.swraid == 1 {
        hostname.push_str(&format!("\nSWRAIDLEVEL {}", install_image.swraid_level));
    }

    let partitions: String = install_image
        .partitions
        .iter()
        .map(|p| format!("\nPART {} {} {}", p.mount, p.file_system, p.size))
        .collect();

    let lvm: String = install_image
        .lvm_definitions
        .iter()
        .map(|l| {
            format!(
                "\nLV {} {} {} {} {}",
                l.volume_group, l.name, l.mount, l.file_system, l.size
            )
        })
        .collect();

    let btrfs: String = install_image
        .btrfs_definitions
        .iter()
        .map(|b| format!("\nSUBVOL {} {} {}", b.volume, b.subvolume, b.mount))
        .collect();

    let image = format!("\nIMAGE {}", input.image);

    format!("{drives}\n{hostname}\n{partitions}\n{lvm}\n{btrfs}\n{image}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Btrfs, Image, Lvm, Partition};

    fn install_image() -> InstallImage {
        InstallImage {
            image: Image {
                path: "my-image".into(),
                ..Default::default()
            },
            partitions: vec![
                Partition {
                    mount: "/boot".into(),
                    file_system: "ext2".into(),
                    size: "512M".into(),
                },
                Partition {
                    mount: "swap".into(),
                    file_system: "swap".into(),
                    size: "4G".into(),
                },
            ],
            lvm_definitions: vec![
                Lvm {
                    volume_group: "vg0".into(),
                    name: "root".into(),
                    mount: "/".into(),
                    file_system: "ext4".into(),
                    size: "10G".into(),
                },
                Lvm {
                    volume_group: "vg0".into(),
                    name: "swap".into(),
                    mount: "swap".into(),
                    file_system: "swap".into(),
                    size: "5G".into(),
                },
            ],
            btrfs_definitions: vec![
                Btrfs {
                    volume: "btrfs.1".into(),
                    subvolume: "@".into(),
                    mount: "/".into(),
                },
                Btrfs {
                    volume: "btrfs.1".into(),
                    subvolume: "@/usr".into(),
                    mount: "/usr".into(),
                },
            ],
            swraid: 0,
            swraid_level: 1,
            post_install_script: String::new(),
        }
    }

    #[test]
    fn test_build_auto_setup() {
        let input = AutoSetupInput {
            os_devices: vec!["device".into()],
            hostname: "my-host".into(),
            image: "my-image".into(),
        };
        assert_eq!(
            build_auto_setup(&install_image(), &input),
            "DRIVE1 /dev/device\n\nHOSTNAME my-host\nSWRAID 0\n\nPART /boot ext2 512M\nPART swap swap 4G\n\nLV vg0 root / ext4 10G\nLV vg0 swap swap swap 5G\n\nSUBVOL btrfs.1 @ /\nSUBVOL btrfs.1 @/usr /usr\n\nIMAGE my-image"
        );
    }

    #[test]
    fn test_software_raid_adds_level_and_drives() {
        let mut image = install_image();
        image.swraid = 1;
        image.lvm_definitions.clear();
        image.btrfs_definitions.clear();
        let input = AutoSetupInput {
            os_devices: vec!["sda".into(), "sdb".into()],
            hostname: "bm-m1".into(),
            image: "/root/img.tgz".into(),
        };
        let out = build_auto_setup(&image, &input);
        assert!(out.starts_with("DRIVE1 /dev/sda\nDRIVE2 /dev/sdb\n"));
        assert!(out.contains("\nSWRAID 1\nSWRAIDLEVEL 1\n"));
        assert!(out.ends_with("\nIMAGE /root/img.tgz"));
    }
}
