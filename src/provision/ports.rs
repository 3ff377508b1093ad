//! Registry proxy port allocation.
//!
//! Every project gets one host port in a configured range, recorded in a
//! shared ConfigMap in the common namespace. Allocation is optimistic: read
//! the map, claim a free port, write back with the read version, and start
//! over from a fresh read on conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use conveyor_common::cluster::ConfigMap;
use conveyor_common::ObjectMeta;
use rand::Rng;
use tracing::debug;

use crate::errors::{ProvisionError, StoreError};
use crate::provision::resources::COMMON_NAMESPACE;
use crate::store::{SharedStore, StoreExt};

pub const PORT_MAP_CONFIGMAP: &str = "registry-proxy-mappings";
pub const PORT_MAP_KEY: &str = "portMap.json";

const MIN_ALLOCATION_ATTEMPTS: u32 = 64;

/// Inclusive port range parsed from `"<low>-<high>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn size(&self) -> usize {
        (self.high - self.low) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    /// First free port scanning from `offset` and wrapping around once.
    pub fn first_free(&self, used: &BTreeSet<u16>, offset: usize) -> Option<u16> {
        let len = self.size();
        (0..len)
            .map(|i| self.low + ((offset + i) % len) as u16)
            .find(|port| !used.contains(port))
    }
}

impl FromStr for PortRange {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProvisionError::InvalidPortRange(s.to_string());
        let (low, high) = s.trim().split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;
        if low == 0 || low > high {
            return Err(invalid());
        }
        Ok(Self { low, high })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Project id to allocated port.
pub type PortMap = BTreeMap<String, u16>;

pub fn read_port_map(cm: &ConfigMap) -> Result<PortMap, StoreError> {
    match cm.data.get(PORT_MAP_KEY) {
        Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(PortMap::new()),
    }
}

fn write_port_map(cm: &mut ConfigMap, map: &PortMap) -> Result<(), StoreError> {
    cm.data
        .insert(PORT_MAP_KEY.to_string(), serde_json::to_string(map)?);
    Ok(())
}

fn random_offset(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

#[derive(Clone)]
pub struct PortAllocator {
    config_maps: SharedStore<ConfigMap>,
    range: PortRange,
}

impl PortAllocator {
    pub fn new(config_maps: SharedStore<ConfigMap>, range: PortRange) -> Self {
        Self { config_maps, range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Every lost write means another allocation landed, and at most
    /// `range.size()` can land, so this many attempts always settle.
    fn max_attempts(&self) -> u32 {
        u32::try_from(self.range.size() + 1)
            .unwrap_or(u32::MAX)
            .max(MIN_ALLOCATION_ATTEMPTS)
    }

    /// Port recorded for `project_id`, if one was ever allocated.
    pub async fn lookup(&self, project_id: &str) -> Result<Option<u16>, StoreError> {
        let Some(cm) = self
            .config_maps
            .get_optional(COMMON_NAMESPACE, PORT_MAP_CONFIGMAP)
            .await?
        else {
            return Ok(None);
        };
        Ok(read_port_map(&cm)?.get(project_id).copied())
    }

    /// Return the port for `project_id`, allocating one when absent.
    pub async fn ensure(&self, project_id: &str) -> Result<u16, ProvisionError> {
        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            let current = self
                .config_maps
                .get_optional(COMMON_NAMESPACE, PORT_MAP_CONFIGMAP)
                .await?;
            let mut map = match &current {
                Some(cm) => read_port_map(cm)?,
                None => PortMap::new(),
            };
            if let Some(port) = map.get(project_id) {
                return Ok(*port);
            }

            let used: BTreeSet<u16> = map.values().copied().collect();
            let port = self
                .range
                .first_free(&used, random_offset(self.range.size()))
                .ok_or_else(|| ProvisionError::NoAvailablePort(self.range.to_string()))?;
            map.insert(project_id.to_string(), port);

            let result = match current {
                Some(mut cm) => {
                    write_port_map(&mut cm, &map)?;
                    self.config_maps.update(cm).await.map(|_| ())
                }
                None => {
                    let mut cm = ConfigMap {
                        metadata: ObjectMeta::new(COMMON_NAMESPACE, PORT_MAP_CONFIGMAP),
                        data: BTreeMap::new(),
                    };
                    write_port_map(&mut cm, &map)?;
                    self.config_maps.create(cm).await.map(|_| ())
                }
            };

            match result {
                Ok(()) => {
                    debug!(project = %project_id, port, "Allocated registry proxy port");
                    return Ok(port);
                }
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    debug!(project = %project_id, attempt, "Port map changed underneath, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProvisionError::PortContention {
            project: project_id.to_string(),
            attempts: max_attempts,
        })
    }
}
