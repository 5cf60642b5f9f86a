//! Synchronous allocation core: the resource pool, the request ledger and the
//! chat texts both are rendered into. Nothing here talks to the network.

pub mod ledger;
pub mod messages;
pub mod pool;

pub use ledger::{LedgerError, PendingRequest, PendingState, RequestLedger};
pub use pool::{PoolCounts, PoolError, Resource, ResourcePool};

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
