//! Point-in-time view of the allocator state

use serde::Serialize;

use crate::allocator::block::BlockPool;
use crate::allocator::trace::TraceEntry;
use crate::backend::acl_backend::DeviceIndex;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    ActiveAllocated,
    ActivePendingFree,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub address: usize,
    pub size: usize,
    pub requested_size: usize,
    pub state: BlockState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub device: DeviceIndex,
    pub address: usize,
    pub total_size: usize,
    pub allocated_size: usize,
    pub active_size: usize,
    pub requested_size: usize,
    pub stream: StreamId,
    pub segment_type: BlockPool,
    pub is_expandable: bool,
    pub blocks: Vec<BlockInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub segments: Vec<SegmentInfo>,
    /// History ring of each device, indexed by device.
    pub device_traces: Vec<Vec<TraceEntry>>,
}

impl SnapshotInfo {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn segments_for(&self, device: DeviceIndex) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.iter().filter(move |s| s.device == device)
    }

    /// Every block in any segment, with its segment's pool.
    pub fn blocks(&self) -> impl Iterator<Item = (&SegmentInfo, &BlockInfo)> {
        self.segments
            .iter()
            .flat_map(|segment| segment.blocks.iter().map(move |block| (segment, block)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = SnapshotInfo {
            segments: vec![SegmentInfo {
                device: 0,
                address: 0x1000,
                total_size: 2048,
                allocated_size: 512,
                active_size: 512,
                requested_size: 500,
                stream: 0,
                segment_type: BlockPool::Small,
                is_expandable: false,
                blocks: vec![BlockInfo {
                    address: 0x1000,
                    size: 512,
                    requested_size: 500,
                    state: BlockState::ActiveAllocated,
                    context: None,
                }],
            }],
            device_traces: vec![Vec::new()],
        };
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"active_allocated\""));
        assert!(json.contains("\"segment_type\": \"small\""));
        assert_eq!(snapshot.blocks().count(), 1);
        assert_eq!(snapshot.segments_for(1).count(), 0);
    }
}
