//! Best-effort fan-out of newly accepted blobs, so caches across the mesh
//! converge.

use std::time::Duration;

use tracing::debug;

/// Tell each verifier about a blob we just accepted. Spawns one detached
/// 10-second POST per target; every failure is swallowed.
pub fn inform_verifiers(
    http: reqwest::Client,
    scheme: &'static str,
    origin_hostname: &str,
    origin_hash: &str,
    origin_signature: &str,
    targets: Vec<String>,
) {
    let origin = origin_hostname.to_lowercase();
    let payload = format!("{origin}\n{origin_hash}\n{origin_signature}");

    for target in targets {
        let http = http.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            let url = format!("{scheme}://{target}/verify");
            let result = http
                .post(&url)
                .timeout(Duration::from_secs(10))
                .body(payload)
                .send()
                .await;
            if let Err(e) = result {
                debug!(target = %target, error = %e, "inform failed");
            }
        });
    }
}
