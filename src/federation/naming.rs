//! Queue naming

use chrono::Utc;
use uuid::Uuid;

const CONTROL_QUEUE_SUFFIX: &str = "FederationControlQueue";
const DYNAMIC_QUEUE_SUFFIX: &str = "FederationDynamicQueue";

/// Well-known control queue of a site
pub fn control_queue_name(site_id: &str) -> String {
    format!("{}_{}", site_id, CONTROL_QUEUE_SUFFIX)
}

/// Fresh dynamic queue name for one subscription of `local` to `remote`.
///
/// Millisecond timestamp plus a uuid fragment, so two subscribes in the same
/// millisecond still get distinct queues.
pub fn dynamic_queue_name(remote_id: &str, local_id: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}_{}",
        remote_id,
        local_id,
        Utc::now().timestamp_millis(),
        &token[..8],
        DYNAMIC_QUEUE_SUFFIX
    )
}
