//! Correlating client for the crypto worker
//!
//! Many logical calls share one request queue. Each request gets a fresh id
//! and a oneshot slot in the pending table; a dispatcher task routes replies
//! back by id. Every pending slot is resolved exactly once: by its reply, by
//! a timeout (the request is abandoned, not cancelled), or by teardown.

use crate::crypto::{EncryptedData, MasterKey};
use crate::error::{Error, Result};
use crate::worker::protocol::{Envelope, Operation, Output, Request, Response};
use crossbeam_channel::Sender;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::debug;
use zeroize::Zeroizing;

const TERMINATED: &str = "worker terminated";

struct ClientInner {
    requests: Sender<Envelope>,
    pending: DashMap<u64, oneshot::Sender<Response>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Handle for issuing worker requests; cheap to clone
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
    timeout: Option<Duration>,
}

impl WorkerClient {
    /// Attach to a request queue and reply stream, spawning the dispatcher
    pub(crate) fn connect(
        requests: Sender<Envelope>,
        replies: UnboundedReceiver<Response>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::WorkerError(format!("no async runtime: {}", e)))?;

        let inner = Arc::new(ClientInner {
            requests,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        runtime.spawn(dispatch_replies(inner.clone(), replies));

        Ok(WorkerClient {
            inner,
            timeout: None,
        })
    }

    /// Apply a deadline to every typed helper call
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn submit(&self, op: Operation) -> Result<(u64, oneshot::Receiver<Response>)> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::WorkerError(TERMINATED.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let name = op.name();
        let sent = self
            .inner
            .requests
            .send(Envelope::Request(Request { id, op }))
            .is_ok();

        // The dispatcher sets `closed` before draining, so a request that
        // raced teardown is either drained or seen as closed here.
        if !sent || self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.remove(&id);
            return Err(Error::WorkerError(TERMINATED.to_string()));
        }

        debug!("Submitted worker request {} ({})", id, name);
        Ok((id, rx))
    }

    /// Issue a request and wait for its reply
    pub async fn call(&self, op: Operation) -> Result<Output> {
        let (_, rx) = self.submit(op)?;
        match rx.await {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(Error::WorkerError(TERMINATED.to_string())),
        }
    }

    /// Issue a request and give up after `timeout`
    ///
    /// On timeout the request is abandoned: its pending slot is removed and
    /// any late reply is dropped, but the worker may still run it.
    pub async fn call_with_timeout(&self, op: Operation, timeout: Duration) -> Result<Output> {
        let (id, rx) = self.submit(op)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(Error::WorkerError(TERMINATED.to_string())),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(Error::WorkerError(format!(
                    "request {} timed out after {:?}",
                    id, timeout
                )))
            }
        }
    }

    async fn request(&self, op: Operation) -> Result<Output> {
        match self.timeout {
            Some(timeout) => self.call_with_timeout(op, timeout).await,
            None => self.call(op).await,
        }
    }

    /// PBKDF2-HMAC-SHA256 on the worker
    pub async fn pbkdf2(
        &self,
        passphrase: String,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<MasterKey> {
        let output = self
            .request(Operation::Pbkdf2 {
                passphrase,
                salt,
                iterations,
            })
            .await?;

        match output {
            Output::Key { key } => MasterKey::from_bytes(&Zeroizing::new(key)),
            other => Err(unexpected("pbkdf2", &other)),
        }
    }

    /// PBKDF2 plus the worker-measured elapsed time
    pub async fn profile_pbkdf2(
        &self,
        passphrase: String,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<(MasterKey, Duration)> {
        let output = self
            .request(Operation::ProfilePbkdf2 {
                passphrase,
                salt,
                iterations,
            })
            .await?;

        match output {
            Output::Profiled { key, elapsed_ms } => {
                let key = MasterKey::from_bytes(&Zeroizing::new(key))?;
                Ok((key, Duration::from_secs_f64(elapsed_ms.max(0.0) / 1000.0)))
            }
            other => Err(unexpected("profilePbkdf2", &other)),
        }
    }

    /// AES-256-GCM encrypt under a fresh IV
    pub async fn encrypt(&self, key: &MasterKey, plaintext: Vec<u8>) -> Result<EncryptedData> {
        let output = self
            .request(Operation::Encrypt {
                key: key.key().to_vec(),
                plaintext,
            })
            .await?;

        match output {
            Output::Encrypted { iv, ciphertext } => EncryptedData::from_parts(&iv, ciphertext),
            other => Err(unexpected("encrypt", &other)),
        }
    }

    /// AES-256-GCM authenticate and decrypt
    pub async fn decrypt(
        &self,
        key: &MasterKey,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let output = self
            .request(Operation::Decrypt {
                key: key.key().to_vec(),
                iv,
                ciphertext,
            })
            .await?;

        match output {
            Output::Plaintext { plaintext } => Ok(plaintext),
            other => Err(unexpected("decrypt", &other)),
        }
    }
}

fn unexpected(op: &str, output: &Output) -> Error {
    let kind = match output {
        Output::Key { .. } => "key",
        Output::Encrypted { .. } => "encrypted",
        Output::Plaintext { .. } => "plaintext",
        Output::Profiled { .. } => "profiled",
    };
    Error::WorkerError(format!("{} returned a {} result", op, kind))
}

async fn dispatch_replies(inner: Arc<ClientInner>, mut replies: UnboundedReceiver<Response>) {
    while let Some(reply) = replies.recv().await {
        match inner.pending.remove(&reply.id) {
            Some((_, slot)) => {
                let _ = slot.send(reply);
            }
            None => debug!("Dropping reply for abandoned request {}", reply.id),
        }
    }

    inner.closed.store(true, Ordering::SeqCst);

    let ids: Vec<u64> = inner.pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, slot)) = inner.pending.remove(&id) {
            let _ = slot.send(Response::failure(id, TERMINATED));
        }
    }
    debug!("Worker reply stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pbkdf2_sha256;
    use crate::worker::CryptoWorker;
    use crossbeam_channel::Receiver;
    use tokio::sync::mpsc::UnboundedSender;

    fn fake_worker() -> (WorkerClient, Receiver<Envelope>, UnboundedSender<Response>) {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
        let client = WorkerClient::connect(request_tx, reply_rx).unwrap();
        (client, request_rx, reply_tx)
    }

    fn next_request(rx: &Receiver<Envelope>) -> Request {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Envelope::Request(request) => request,
            Envelope::Shutdown => panic!("unexpected shutdown"),
        }
    }

    fn decrypt_op() -> Operation {
        Operation::Decrypt {
            key: vec![0; 32],
            iv: vec![0; 12],
            ciphertext: vec![0; 16],
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_to_their_own_replies() {
        let (worker, client) = CryptoWorker::spawn(3).unwrap();

        let calls = (0u8..8).map(|n| {
            let client = client.clone();
            async move {
                let key = client.pbkdf2("pw".to_string(), vec![n; 16], 1_000).await?;
                Ok::<_, Error>((n, key))
            }
        });

        for (n, key) in futures::future::try_join_all(calls).await.unwrap() {
            let expected = pbkdf2_sha256(b"pw", &[n; 16], 1_000).unwrap();
            assert_eq!(key.key(), &*expected, "reply for salt {} misrouted", n);
        }
        assert_eq!(client.pending_requests(), 0);

        worker.shutdown();
    }

    #[tokio::test]
    async fn test_out_of_order_and_unknown_replies() {
        let (client, requests, replies) = fake_worker();

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call(decrypt_op()).await }
        });
        let a = tokio::task::spawn_blocking({
            let requests = requests.clone();
            move || next_request(&requests)
        })
        .await
        .unwrap();

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call(decrypt_op()).await }
        });
        let b = tokio::task::spawn_blocking(move || next_request(&requests))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        replies.send(Response::failure(9_999, "stray")).unwrap();
        replies
            .send(Response::success(b.id, Output::Plaintext { plaintext: vec![2] }))
            .unwrap();
        replies
            .send(Response::success(a.id, Output::Plaintext { plaintext: vec![1] }))
            .unwrap();

        assert_eq!(
            first.await.unwrap().unwrap(),
            Output::Plaintext { plaintext: vec![1] }
        );
        assert_eq!(
            second.await.unwrap().unwrap(),
            Output::Plaintext { plaintext: vec![2] }
        );
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_timeout_abandons_request() {
        let (client, requests, replies) = fake_worker();

        let err = client
            .call_with_timeout(decrypt_op(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerError(ref msg) if msg.contains("timed out")));
        assert_eq!(client.pending_requests(), 0);

        // A late reply to the abandoned request is ignored
        let stale = next_request(&requests);
        replies
            .send(Response::success(stale.id, Output::Plaintext { plaintext: vec![] }))
            .unwrap();

        let live = tokio::spawn({
            let client = client.clone();
            async move { client.call(decrypt_op()).await }
        });
        let req = tokio::task::spawn_blocking(move || next_request(&requests))
            .await
            .unwrap();
        replies
            .send(Response::success(req.id, Output::Plaintext { plaintext: vec![7] }))
            .unwrap();
        assert_eq!(
            live.await.unwrap().unwrap(),
            Output::Plaintext { plaintext: vec![7] }
        );
    }

    #[tokio::test]
    async fn test_teardown_rejects_all_pending() {
        let (client, requests, replies) = fake_worker();

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.call(decrypt_op()).await })
            })
            .collect();

        tokio::task::spawn_blocking(move || {
            for _ in 0..3 {
                next_request(&requests);
            }
        })
        .await
        .unwrap();
        drop(replies);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::WorkerError(ref msg) if msg == TERMINATED));
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_worker_errors_keep_their_kind() {
        let (worker, client) = CryptoWorker::spawn(1).unwrap();
        let key = MasterKey::from_bytes(&[3u8; 32]).unwrap();

        let sealed = client.encrypt(&key, b"payload".to_vec()).await.unwrap();
        let mut ciphertext = sealed.ciphertext.clone();
        ciphertext[0] ^= 1;

        let err = client
            .decrypt(&key, sealed.nonce.clone(), ciphertext)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DecryptionFailure));

        let plaintext = client
            .decrypt(&key, sealed.nonce, sealed.ciphertext)
            .await
            .unwrap();
        assert_eq!(plaintext, b"payload");

        worker.shutdown();
    }

    #[tokio::test]
    async fn test_profile_reports_elapsed() {
        let (worker, client) = CryptoWorker::spawn(1).unwrap();
        let (key, elapsed) = client
            .profile_pbkdf2("pw".to_string(), vec![1; 32], 2_000)
            .await
            .unwrap();

        assert_eq!(key.key(), &*pbkdf2_sha256(b"pw", &[1; 32], 2_000).unwrap());
        assert!(elapsed > Duration::ZERO);
        worker.shutdown();
    }
}
