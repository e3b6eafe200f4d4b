//! Controller checkpointing. A snapshot is a small framed header plus the
//! bincode-encoded controller; the frame rejects foreign or incompatible
//! payloads before deserialization is attempted.

use common_error::{ArmadaError, ArmadaResult};
use serde::{Deserialize, Serialize};

use crate::operation::controller::OperationController;

const SNAPSHOT_MAGIC: u32 = 0x4152_4d41;
/// Bump on any change to the controller's persistent layout.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotFrame {
    magic: u32,
    version: u32,
    payload: Vec<u8>,
}

pub fn save(controller: &OperationController) -> ArmadaResult<Vec<u8>> {
    let payload = bincode::serialize(controller)
        .map_err(|e| ArmadaError::SnapshotError(format!("controller serialization failed: {e}")))?;
    let frame = SnapshotFrame {
        magic: SNAPSHOT_MAGIC,
        version: SNAPSHOT_VERSION,
        payload,
    };
    bincode::serialize(&frame)
        .map_err(|e| ArmadaError::SnapshotError(format!("snapshot framing failed: {e}")))
}

pub fn load(bytes: &[u8]) -> ArmadaResult<OperationController> {
    let frame: SnapshotFrame = bincode::deserialize(bytes)
        .map_err(|e| ArmadaError::SnapshotError(format!("corrupted snapshot frame: {e}")))?;
    if frame.magic != SNAPSHOT_MAGIC {
        return Err(ArmadaError::SnapshotError(format!(
            "bad snapshot magic {:#010x}",
            frame.magic
        )));
    }
    if frame.version != SNAPSHOT_VERSION {
        return Err(ArmadaError::SnapshotError(format!(
            "unsupported snapshot version {} (expected {})",
            frame.version, SNAPSHOT_VERSION
        )));
    }
    bincode::deserialize(&frame.payload)
        .map_err(|e| ArmadaError::SnapshotError(format!("controller deserialization failed: {e}")))
}
