//! Crypto worker threads

use crate::crypto::{decrypt, encrypt, pbkdf2_sha256, profile_pbkdf2, EncryptedData};
use crate::error::{Error, Result};
use crate::worker::client::WorkerClient;
use crate::worker::protocol::{Envelope, Operation, Output, Request, Response};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Pool of OS threads running KDF and AEAD requests
pub struct CryptoWorker {
    requests: Sender<Envelope>,
    threads: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl CryptoWorker {
    /// Start `threads` workers and a client connected to them
    ///
    /// Must be called from within a tokio runtime; the client's reply
    /// dispatcher runs as a task on it.
    pub fn spawn(threads: usize) -> Result<(CryptoWorker, WorkerClient)> {
        if threads == 0 {
            return Err(Error::InvalidConfig(
                "Worker needs at least one thread".to_string(),
            ));
        }

        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();

        let client = WorkerClient::connect(request_tx.clone(), reply_rx)?;

        let mut handles = Vec::with_capacity(threads);
        for n in 0..threads {
            let requests = request_rx.clone();
            let replies = reply_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("memvault-crypto-{}", n))
                .spawn(move || run(requests, replies))?;
            handles.push(handle);
        }

        info!("Crypto worker started with {} threads", threads);
        Ok((
            CryptoWorker {
                requests: request_tx,
                threads: handles,
                stopped: false,
            },
            client,
        ))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for _ in 0..self.threads.len() {
            let _ = self.requests.send(Envelope::Shutdown);
        }
    }

    /// Stop all threads and wait for them; pending requests are rejected
    pub fn shutdown(mut self) {
        self.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Crypto worker thread panicked during shutdown");
            }
        }
        info!("Crypto worker stopped");
    }
}

impl Drop for CryptoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(requests: Receiver<Envelope>, replies: UnboundedSender<Response>) {
    while let Ok(envelope) = requests.recv() {
        let Request { id, op } = match envelope {
            Envelope::Request(request) => request,
            Envelope::Shutdown => break,
        };

        let name = op.name();
        let reply = match catch_unwind(AssertUnwindSafe(|| handle(op))) {
            Ok(Ok(output)) => Response::success(id, output),
            Ok(Err(e)) => Response::from_error(id, &e),
            Err(_) => Response::failure(id, format!("{} panicked", name)),
        };

        debug!("Worker finished request {} ({}), ok={}", id, name, reply.ok);
        if replies.send(reply).is_err() {
            break;
        }
    }
}

fn handle(op: Operation) -> Result<Output> {
    match op {
        Operation::Pbkdf2 {
            passphrase,
            salt,
            iterations,
        } => {
            let passphrase = Zeroizing::new(passphrase);
            let key = pbkdf2_sha256(passphrase.as_bytes(), &salt, iterations)?;
            Ok(Output::Key { key: key.to_vec() })
        }
        Operation::Encrypt { key, plaintext } => {
            let key = Zeroizing::new(key);
            let encrypted = encrypt(&key, &plaintext, &[])?;
            Ok(Output::Encrypted {
                iv: encrypted.nonce,
                ciphertext: encrypted.ciphertext,
            })
        }
        Operation::Decrypt {
            key,
            iv,
            ciphertext,
        } => {
            let key = Zeroizing::new(key);
            let encrypted = EncryptedData::from_parts(&iv, ciphertext)?;
            let plaintext = decrypt(&key, &encrypted, &[])?;
            Ok(Output::Plaintext { plaintext })
        }
        Operation::ProfilePbkdf2 {
            passphrase,
            salt,
            iterations,
        } => {
            let passphrase = Zeroizing::new(passphrase);
            let (key, elapsed) = profile_pbkdf2(passphrase.as_bytes(), &salt, iterations)?;
            Ok(Output::Profiled {
                key: key.key().to_vec(),
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            })
        }
    }
}
