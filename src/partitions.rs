/// Disk partition layout sent with a server order
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Size of the mandatory /boot partition, GB
pub const BOOT_SIZE_GB: u32 = 1;
/// Swap size when none is declared, GB
pub const DEFAULT_SWAP_SIZE_GB: u32 = 5;

/// Namespace for layout node ids
const LAYOUT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_0e4a_52b7_4d2e_9a8c_3f51_d0b2_7e19);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RaidLevel {
    #[default]
    #[serde(rename = "none", alias = "No RAID")]
    None,
    #[serde(rename = "raid0", alias = "RAID0")]
    Raid0,
    #[serde(rename = "raid1", alias = "RAID1")]
    Raid1,
}

impl RaidLevel {
    fn min_disks(&self) -> usize {
        match self {
            RaidLevel::None => 1,
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
        }
    }
}

impl FromStr for RaidLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(' ', "").as_str() {
            "none" | "noraid" => Ok(RaidLevel::None),
            "raid0" => Ok(RaidLevel::Raid0),
            "raid1" => Ok(RaidLevel::Raid1),
            other => Err(Error::InvalidConfig(format!("unsupported RAID level '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Ext4,
    Ext3,
    Xfs,
    Btrfs,
    Swap,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsType::Ext4 => "ext4",
            FsType::Ext3 => "ext3",
            FsType::Xfs => "xfs",
            FsType::Btrfs => "btrfs",
            FsType::Swap => "swap",
        };
        f.write_str(name)
    }
}

/// A physical disk of the ordered configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// GB
    pub size: u32,
    /// e.g. "SSD SATA", "NVMe"
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// An extra mount point declared by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPartition {
    pub mount: String,
    /// GB
    pub size: u32,
    #[serde(default)]
    pub fstype: FsType,
}

/// Declared disk layout of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub raid: RaidLevel,
    /// GB
    pub root_size: u32,
    /// GB
    #[serde(default = "default_swap_size")]
    pub swap_size: u32,
    #[serde(default)]
    pub partitions: Vec<CustomPartition>,
}

fn default_swap_size() -> u32 {
    DEFAULT_SWAP_SIZE_GB
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveMatch {
    pub size: u32,
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// One node of the partitioning graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionNode {
    LocalDrive {
        id: Uuid,
        #[serde(rename = "match")]
        matcher: DriveMatch,
    },
    SoftRaid {
        id: Uuid,
        level: RaidLevel,
        members: Vec<Uuid>,
    },
    Partition {
        id: Uuid,
        device: Uuid,
        priority: u32,
        size: u32,
        mount: String,
        fstype: FsType,
    },
    Filesystem {
        id: Uuid,
        device: Uuid,
        priority: u32,
        size: u32,
        mount: String,
        fstype: FsType,
    },
}

/// Request payload wrapper: `{"partitions": [...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionsConfig {
    pub partitions: Vec<PartitionNode>,
}

impl DiskLayout {
    /// Capacity usable for partitions under the chosen RAID level, GB
    pub fn usable_capacity(&self) -> u64 {
        let sizes = self.disks.iter().map(|d| u64::from(d.size));
        match self.raid {
            RaidLevel::None => self.disks.first().map(|d| u64::from(d.size)).unwrap_or(0),
            RaidLevel::Raid0 => sizes.sum(),
            RaidLevel::Raid1 => sizes.min().unwrap_or(0),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.disks.len() < self.raid.min_disks() {
            return Err(Error::InvalidConfig(format!(
                "{:?} needs at least {} disks, got {}",
                self.raid,
                self.raid.min_disks(),
                self.disks.len()
            )));
        }
        if self.root_size == 0 {
            return Err(Error::InvalidConfig("root_size must be positive".to_string()));
        }

        let mut mounts = BTreeSet::new();
        for partition in &self.partitions {
            if !partition.mount.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "mount point '{}' must be absolute",
                    partition.mount
                )));
            }
            if partition.mount == "/" || partition.mount == "/boot" {
                return Err(Error::InvalidConfig(format!(
                    "mount point '{}' is reserved",
                    partition.mount
                )));
            }
            if partition.fstype == FsType::Swap {
                return Err(Error::InvalidConfig(
                    "swap is configured with swap_size, not as a partition".to_string(),
                ));
            }
            if partition.size == 0 {
                return Err(Error::InvalidConfig(format!(
                    "partition '{}' must have a positive size",
                    partition.mount
                )));
            }
            if !mounts.insert(partition.mount.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "mount point '{}' is declared twice",
                    partition.mount
                )));
            }
        }

        let requested = u64::from(BOOT_SIZE_GB)
            + u64::from(self.root_size)
            + u64::from(self.swap_size)
            + self.partitions.iter().map(|p| u64::from(p.size)).sum::<u64>();
        let capacity = self.usable_capacity();
        if requested > capacity {
            return Err(Error::InvalidConfig(format!(
                "layout needs {} GB but only {} GB are usable",
                requested, capacity
            )));
        }
        Ok(())
    }

    /// Build the partitioning graph. Node ids are derived from their role,
    /// so the same layout always yields the same payload.
    pub fn build(&self) -> Result<PartitionsConfig> {
        self.validate()?;

        let mut nodes = Vec::new();
        let mut drives = Vec::new();
        for (index, disk) in self.disks.iter().enumerate() {
            let id = node_id(&format!("drive-{}", index));
            drives.push(id);
            nodes.push(PartitionNode::LocalDrive {
                id,
                matcher: DriveMatch {
                    size: disk.size,
                    disk_type: disk.disk_type.clone(),
                },
            });
        }

        let target = match self.raid {
            RaidLevel::None => drives[0],
            level => {
                let id = node_id("soft-raid");
                nodes.push(PartitionNode::SoftRaid {
                    id,
                    level,
                    members: drives.clone(),
                });
                id
            }
        };

        nodes.push(PartitionNode::Partition {
            id: node_id("boot"),
            device: target,
            priority: 0,
            size: BOOT_SIZE_GB,
            mount: "/boot".to_string(),
            fstype: FsType::Ext4,
        });
        nodes.push(PartitionNode::Partition {
            id: node_id("root"),
            device: target,
            priority: 1,
            size: self.root_size,
            mount: "/".to_string(),
            fstype: FsType::Ext4,
        });
        if self.swap_size > 0 {
            nodes.push(PartitionNode::Filesystem {
                id: node_id("swap"),
                device: target,
                priority: 2,
                size: self.swap_size,
                mount: "swap".to_string(),
                fstype: FsType::Swap,
            });
        }
        for partition in &self.partitions {
            nodes.push(PartitionNode::Partition {
                id: node_id(&format!("mount:{}", partition.mount)),
                device: target,
                priority: 2,
                size: partition.size,
                mount: partition.mount.clone(),
                fstype: partition.fstype,
            });
        }

        Ok(PartitionsConfig { partitions: nodes })
    }
}

fn node_id(role: &str) -> Uuid {
    Uuid::new_v5(&LAYOUT_NAMESPACE, role.as_bytes())
}
