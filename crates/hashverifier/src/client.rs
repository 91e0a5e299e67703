//! The verify/inform client.
//!
//! Given a blob `hostname\nbase64(sha256(data))\nsignature`, decide whether
//! to accept it: cached digest first, then direct signature verification
//! (with a single live refetch when a cached key turns out stale), then a
//! consensus vote across trusted nodes.

use std::{
    collections::BTreeSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    futures::future::join_all,
    rand::seq::SliceRandom,
    sha2::{Digest, Sha256},
    tracing::debug,
};

use crate::{
    cache::{HashCache, NopCache},
    inform::inform_verifiers,
    signing,
};

const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_FETCH_LIMIT: usize = 1_000_000;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct VerifierClient {
    cache: Arc<dyn HashCache>,
    informants: RwLock<Vec<String>>,
    trusted: RwLock<Vec<String>>,
    hostname: String,
    consensus: u32,
    http: reqwest::Client,
    scheme: &'static str,
}

impl VerifierClient {
    /// `hostname` is our own name, used for self-skip; `consensus` is the
    /// number of trusted confirmations needed to clear an unverifiable blob
    /// (zero disables the fallback).
    #[must_use]
    pub fn new(
        cache: Option<Arc<dyn HashCache>>,
        informants: Vec<String>,
        trusted: Vec<String>,
        hostname: &str,
        consensus: u32,
    ) -> Self {
        Self {
            cache: cache.unwrap_or_else(|| Arc::new(NopCache)),
            informants: RwLock::new(normalize(informants)),
            trusted: RwLock::new(normalize(trusted)),
            hostname: hostname.trim().to_lowercase(),
            consensus,
            http: reqwest::Client::new(),
            scheme: "https",
        }
    }

    /// Talk plain HTTP instead of HTTPS. For tests and meshes whose TLS is
    /// terminated in front of the node.
    #[must_use]
    pub fn with_plain_http(mut self) -> Self {
        self.scheme = "http";
        self
    }

    pub fn add_informants(&self, hosts: &[String]) {
        append_unique(&mut self.informants.write().unwrap_or_else(|e| e.into_inner()), hosts);
    }

    pub fn add_trusted_nodes(&self, hosts: &[String]) {
        append_unique(&mut self.trusted.write().unwrap_or_else(|e| e.into_inner()), hosts);
    }

    /// Decide whether a hash blob should be accepted. The boolean is exactly
    /// what a `/verify` endpoint should answer.
    pub async fn process_hash_blob(&self, blob: &str, skip: &[String]) -> bool {
        let blob = blob.trim();
        if !self.hostname.is_empty() && skip.iter().any(|s| s == &self.hostname) {
            return false;
        }

        let total_hash = Sha256::digest(blob.as_bytes()).to_vec();
        if self.cache.exists(&total_hash).await {
            // Already cleared; informing happened when it was first accepted.
            return true;
        }

        let mut parts = blob.splitn(3, '\n');
        let (Some(hostname), Some(hash_str), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if signing::decode_signature(signature).is_none() {
            // Cannot be a valid message.
            return false;
        }

        if self.verify_against_key(hostname, hash_str, signature).await
            || self.consensus_vote(blob, skip).await
        {
            self.cache.ensure(&total_hash).await;
            inform_verifiers(
                self.http.clone(),
                self.scheme,
                hostname,
                hash_str,
                signature,
                self.informants_and_trusted(),
            );
            return true;
        }
        false
    }

    /// Direct verification against the origin's public key: cache first, the
    /// network second, and one forced refetch when a cached key fails (a
    /// stale stored key must not poison us).
    async fn verify_against_key(&self, hostname: &str, hash_str: &str, signature: &str) -> bool {
        let cached = self.cache.lookup_key(hostname).await;
        let from_cache = cached.is_some();
        let key = match cached {
            Some(key) => Some(key),
            None => self.fetch_key(hostname).await,
        };
        let Some(key) = key else { return false };

        if signing::verify_detached(&key, hash_str, signature) {
            return true;
        }
        if !from_cache {
            return false;
        }

        self.cache.invalidate_key(hostname).await;
        let Some(fresh) = self.fetch_key(hostname).await else {
            return false;
        };
        signing::verify_detached(&fresh, hash_str, signature)
    }

    /// One HTTPS GET for the node's public key; a success is written to the
    /// cache.
    async fn fetch_key(&self, hostname: &str) -> Option<Vec<u8>> {
        let url = format!("{}://{}/spherical.pub", self.scheme, hostname);
        let response = self
            .http
            .get(&url)
            .timeout(KEY_FETCH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        let mut body = response.bytes().await.ok()?.to_vec();
        body.truncate(KEY_FETCH_LIMIT);
        self.cache.write_key(hostname, &body).await;
        Some(body)
    }

    /// Trusted-node fallback: shuffle a copy of the trusted list and POST the
    /// blob in waves of `max(3, k)` until `k` nodes answered `true` or the
    /// list is exhausted. Waves already in flight are awaited.
    async fn consensus_vote(&self, blob: &str, skip: &[String]) -> bool {
        let k = self.consensus as usize;
        if k == 0 {
            return false;
        }
        let mut pool = self.trusted.read().unwrap_or_else(|e| e.into_inner()).clone();
        if pool.len() < k {
            return false;
        }
        pool.shuffle(&mut rand::rng());

        let wave_size = k.max(3);
        let skip_header = self.skip_header(skip);
        let mut yes = 0usize;

        for wave in pool.chunks(wave_size) {
            let posts = wave
                .iter()
                .filter(|node| !skip.contains(*node))
                .map(|node| self.post_verify(node, blob, &skip_header));
            yes += join_all(posts).await.into_iter().filter(|v| *v).count();
            if yes >= k {
                break;
            }
        }

        debug!(yes, needed = k, "consensus vote finished");
        yes >= k
    }

    async fn post_verify(&self, node: &str, blob: &str, skip_header: &str) -> bool {
        let url = format!("{}://{}/verify", self.scheme, node);
        let response = self
            .http
            .post(&url)
            .header("X-Skip", skip_header)
            .timeout(VERIFY_TIMEOUT)
            .body(blob.to_owned())
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => r
                .text()
                .await
                .map(|body| body.trim() == "true")
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Effective skip list forwarded on consensus requests:
    /// trusted ∪ caller skip ∪ our own hostname when it is non-empty.
    fn skip_header(&self, skip: &[String]) -> String {
        let mut set: Vec<String> = self
            .trusted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for host in skip {
            if !set.contains(host) {
                set.push(host.clone());
            }
        }
        if !self.hostname.is_empty() && !set.contains(&self.hostname) {
            set.push(self.hostname.clone());
        }
        set.join(",")
    }

    fn informants_and_trusted(&self) -> Vec<String> {
        let mut set = BTreeSet::new();
        set.extend(self.informants.read().unwrap_or_else(|e| e.into_inner()).iter().cloned());
        set.extend(self.trusted.read().unwrap_or_else(|e| e.into_inner()).iter().cloned());
        set.into_iter().collect()
    }
}

/// Parse an `X-Skip` header into a clean host list.
#[must_use]
pub fn parse_skip_header(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn normalize(hosts: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(hosts.len());
    append_unique(&mut out, &hosts);
    out
}

fn append_unique(existing: &mut Vec<String>, hosts: &[String]) {
    for host in hosts {
        let host = host.trim().to_lowercase();
        if !host.is_empty() && !existing.contains(&host) {
            existing.push(host);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cache_memory::MemoryCache, signing::SigningIdentity},
        base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    };

    fn signed_blob(identity: &SigningIdentity, hostname: &str, data: &[u8]) -> String {
        let hash_str = BASE64.encode(Sha256::digest(data));
        let signature = identity.sign(&hash_str).unwrap();
        format!("{hostname}\n{hash_str}\n{signature}")
    }

    fn client_with_cache(cache: Arc<MemoryCache>, trusted: Vec<String>, consensus: u32) -> VerifierClient {
        VerifierClient::new(Some(cache), vec![], trusted, "", consensus).with_plain_http()
    }

    #[tokio::test]
    async fn test_cached_digest_fast_path() {
        let cache = Arc::new(MemoryCache::new());
        let blob = "host.example.com\nhash\nc2ln";
        cache
            .ensure(&Sha256::digest(blob.as_bytes()).to_vec())
            .await;

        let client = client_with_cache(cache, vec![], 0);
        assert!(client.process_hash_blob(blob, &[]).await);
    }

    #[tokio::test]
    async fn test_self_in_skip_list_refuses() {
        let client = VerifierClient::new(None, vec![], vec![], "Me.Example.Com", 0);
        assert!(
            !client
                .process_hash_blob("a\nb\nc2ln", &["me.example.com".to_owned()])
                .await
        );
    }

    #[tokio::test]
    async fn test_malformed_blob_refused() {
        let client = VerifierClient::new(None, vec![], vec![], "", 0);
        assert!(!client.process_hash_blob("only-one-line", &[]).await);
        assert!(!client.process_hash_blob("host\nhash\nnot base64!!", &[]).await);
    }

    #[tokio::test]
    async fn test_verifies_with_cached_key_offline() {
        let identity = SigningIdentity::generate().unwrap();
        let cache = Arc::new(MemoryCache::new());
        cache
            .write_key("origin.example.com", identity.public_pem().as_bytes())
            .await;

        let client = client_with_cache(Arc::clone(&cache), vec![], 0);
        let blob = signed_blob(&identity, "origin.example.com", b"{\"salt\":\"x\"}");
        assert!(client.process_hash_blob(&blob, &[]).await);

        // The digest is now recorded; even a nonsense cache lookup clears it.
        assert!(
            cache
                .exists(&Sha256::digest(blob.trim().as_bytes()).to_vec())
                .await
        );
    }

    #[tokio::test]
    async fn test_fetches_key_once_then_caches() {
        let identity = SigningIdentity::generate().unwrap();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/spherical.pub")
            .with_status(200)
            .with_body(identity.public_pem())
            .expect(1)
            .create_async()
            .await;

        let host = server.host_with_port();
        let cache = Arc::new(MemoryCache::new());
        let client = client_with_cache(Arc::clone(&cache), vec![], 0);

        let first = signed_blob(&identity, &host, b"{\"salt\":\"1\"}");
        let second = signed_blob(&identity, &host, b"{\"salt\":\"2\"}");
        assert!(client.process_hash_blob(&first, &[]).await);
        // Second blob: key must come from the cache, not another GET.
        assert!(client.process_hash_blob(&second, &[]).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_cached_key_triggers_exactly_one_refetch() {
        let identity = SigningIdentity::generate().unwrap();
        let stale = SigningIdentity::generate().unwrap();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/spherical.pub")
            .with_status(200)
            .with_body(identity.public_pem())
            .expect(1)
            .create_async()
            .await;

        let host = server.host_with_port();
        let cache = Arc::new(MemoryCache::new());
        cache.write_key(&host, stale.public_pem().as_bytes()).await;

        let client = client_with_cache(Arc::clone(&cache), vec![], 0);
        let blob = signed_blob(&identity, &host, b"{\"salt\":\"x\"}");
        assert!(client.process_hash_blob(&blob, &[]).await);
        mock.assert_async().await;

        // Cache was repaired with the live key.
        assert_eq!(
            cache.lookup_key(&host).await,
            Some(identity.public_pem().as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn test_unverifiable_key_and_no_consensus_refused() {
        let identity = SigningIdentity::generate().unwrap();
        let wrong = SigningIdentity::generate().unwrap();
        let cache = Arc::new(MemoryCache::new());
        // Wrong key cached for a host that is unreachable: refetch fails,
        // no trusted nodes configured.
        cache
            .write_key("127.0.0.1:1", wrong.public_pem().as_bytes())
            .await;

        let client = client_with_cache(cache, vec![], 3);
        let blob = signed_blob(&identity, "127.0.0.1:1", b"{\"salt\":\"x\"}");
        assert!(!client.process_hash_blob(&blob, &[]).await);
    }

    #[tokio::test]
    async fn test_consensus_fallback_accepts_and_records() {
        // Origin's key is gone; three trusted nodes vouch for the blob.
        let identity = SigningIdentity::generate().unwrap();
        let mut trusted_servers = Vec::new();
        let mut mocks = Vec::new();
        for _ in 0..3 {
            let mut server = mockito::Server::new_async().await;
            // Each trusted node sees the consensus POST and may also receive
            // the best-effort inform afterwards.
            let mock = server
                .mock("POST", "/verify")
                .with_status(200)
                .with_body("true")
                .expect_at_least(1)
                .create_async()
                .await;
            mocks.push(mock);
            trusted_servers.push(server);
        }
        let trusted: Vec<String> = trusted_servers.iter().map(|s| s.host_with_port()).collect();

        let cache = Arc::new(MemoryCache::new());
        let client = client_with_cache(Arc::clone(&cache), trusted, 3);
        let blob = signed_blob(&identity, "gone.example.com", b"{\"salt\":\"x\"}");

        assert!(client.process_hash_blob(&blob, &[]).await);
        for mock in &mocks {
            mock.assert_async().await;
        }
        // Consensus acceptance records the digest like direct verification.
        assert!(
            cache
                .exists(&Sha256::digest(blob.trim().as_bytes()).to_vec())
                .await
        );
    }

    #[tokio::test]
    async fn test_consensus_short_of_threshold_refused() {
        let identity = SigningIdentity::generate().unwrap();
        let mut servers = Vec::new();
        for answer in ["true", "false", "false"] {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/verify")
                .with_status(200)
                .with_body(answer)
                .create_async()
                .await;
            servers.push(server);
        }
        let trusted: Vec<String> = servers.iter().map(|s| s.host_with_port()).collect();

        let client = client_with_cache(Arc::new(MemoryCache::new()), trusted, 2);
        let blob = signed_blob(&identity, "gone.example.com", b"{\"salt\":\"x\"}");
        assert!(!client.process_hash_blob(&blob, &[]).await);
    }

    #[tokio::test]
    async fn test_consensus_disabled_or_undersized() {
        let client = VerifierClient::new(None, vec![], vec!["a".into(), "b".into()], "", 0);
        assert!(!client.consensus_vote("blob", &[]).await);

        let client = VerifierClient::new(None, vec![], vec!["a".into()], "", 3);
        assert!(!client.consensus_vote("blob", &[]).await);
    }

    #[test]
    fn test_skip_header_merges_trusted_skip_and_self() {
        let client = VerifierClient::new(
            None,
            vec![],
            vec!["t1.example.com".into(), "t2.example.com".into()],
            "self.example.com",
            3,
        );
        let header = client.skip_header(&["caller.example.com".to_owned()]);
        let parts: Vec<&str> = header.split(',').collect();
        assert_eq!(parts, vec![
            "t1.example.com",
            "t2.example.com",
            "caller.example.com",
            "self.example.com",
        ]);
    }

    #[test]
    fn test_skip_header_omits_empty_self() {
        // With no hostname configured, the header is just trusted + skip;
        // no empty element sneaks in.
        let client = VerifierClient::new(None, vec![], vec!["t1.example.com".into()], "", 3);
        let header = client.skip_header(&[]);
        assert_eq!(header, "t1.example.com");
    }

    #[test]
    fn test_parse_skip_header() {
        assert_eq!(
            parse_skip_header(Some(" A.example.com, b.example.com ,,")),
            vec!["a.example.com".to_owned(), "b.example.com".to_owned()]
        );
        assert!(parse_skip_header(None).is_empty());
    }

    #[test]
    fn test_host_lists_deduplicate_and_lowercase() {
        let client = VerifierClient::new(
            None,
            vec!["A.example.com".into()],
            vec!["T.example.com".into()],
            "",
            3,
        );
        client.add_informants(&["a.example.com".to_owned(), "t.example.com".to_owned()]);
        assert_eq!(client.informants_and_trusted(), vec![
            "a.example.com".to_owned(),
            "t.example.com".to_owned(),
        ]);
    }
}
