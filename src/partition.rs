//! Partitioning of the patch population by touched locations.
use crate::patch::{BreakPoint, Patch};
use crate::util::sha256_hex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

const MAX_ID_LEN: usize = 200;

/// Deterministic name for a set of breakpoints, usable as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn from_breakpoints<'a>(breakpoints: impl IntoIterator<Item = &'a BreakPoint>) -> Self {
        let mut points: Vec<&BreakPoint> = breakpoints.into_iter().collect();
        points.sort();
        points.dedup();
        let joined = points
            .iter()
            .map(|bp| bp.to_string().replace('/', "").replace(':', "_").to_lowercase())
            .collect::<Vec<_>>()
            .join("__");
        if joined.len() > MAX_ID_LEN {
            return Self(format!("h{}", &sha256_hex(joined.as_bytes())[..32]));
        }
        if joined.is_empty() {
            return Self("no-location".to_string());
        }
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attach partition ids and return the population grouped by partition.
pub fn assign_partitions(patches: &mut [Patch]) -> BTreeMap<PartitionId, Vec<String>> {
    let mut groups: BTreeMap<PartitionId, Vec<String>> = BTreeMap::new();
    for patch in patches.iter_mut() {
        let id = PartitionId::from_breakpoints(patch.breakpoints());
        groups.entry(id.clone()).or_default().push(patch.id.clone());
        patch.partition = Some(id);
    }
    tracing::info!(
        partitions = groups.len(),
        patches = patches.len(),
        "partitions assigned"
    );
    groups
}
