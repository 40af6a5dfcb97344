//! Worker wire protocol
//!
//! Requests are `{id, op, payload}` and replies `{id, ok, result?, error?}`.
//! Failed replies also carry a `code` so the client can rebuild the
//! original error kind.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// One operation and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "camelCase")]
pub enum Operation {
    Pbkdf2 {
        passphrase: String,
        salt: Vec<u8>,
        iterations: u32,
    },
    Encrypt {
        key: Vec<u8>,
        plaintext: Vec<u8>,
    },
    Decrypt {
        key: Vec<u8>,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    ProfilePbkdf2 {
        passphrase: String,
        salt: Vec<u8>,
        iterations: u32,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Pbkdf2 { .. } => "pbkdf2",
            Operation::Encrypt { .. } => "encrypt",
            Operation::Decrypt { .. } => "decrypt",
            Operation::ProfilePbkdf2 { .. } => "profilePbkdf2",
        }
    }
}

/// A correlated request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

/// Successful operation output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Output {
    Key {
        key: Vec<u8>,
    },
    Encrypted {
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    Plaintext {
        plaintext: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Profiled {
        key: Vec<u8>,
        elapsed_ms: f64,
    },
}

/// Error class carried alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultCode {
    DecryptionFailure,
    CorruptInput,
    KeyDerivation,
    Internal,
}

/// A reply to exactly one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Output>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FaultCode>,
}

impl Response {
    pub fn success(id: u64, output: Output) -> Self {
        Response {
            id,
            ok: true,
            result: Some(output),
            error: None,
            code: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Response {
            id,
            ok: false,
            result: None,
            error: Some(message.into()),
            code: None,
        }
    }

    /// Failure reply describing `err`
    pub fn from_error(id: u64, err: &Error) -> Self {
        let (code, message) = match err {
            Error::DecryptionFailure => (FaultCode::DecryptionFailure, err.to_string()),
            Error::CorruptContainer(msg) => (FaultCode::CorruptInput, msg.clone()),
            Error::KeyDerivation(msg) => (FaultCode::KeyDerivation, msg.clone()),
            other => (FaultCode::Internal, other.to_string()),
        };

        Response {
            code: Some(code),
            ..Response::failure(id, message)
        }
    }

    /// Turn the reply back into a local result
    pub fn into_result(self) -> crate::error::Result<Output> {
        if self.ok {
            return self.result.ok_or_else(|| {
                Error::WorkerError(format!("reply {} carried no result", self.id))
            });
        }

        let message = self
            .error
            .unwrap_or_else(|| "unspecified worker failure".to_string());

        Err(match self.code {
            Some(FaultCode::DecryptionFailure) => Error::DecryptionFailure,
            Some(FaultCode::CorruptInput) => Error::CorruptContainer(message),
            Some(FaultCode::KeyDerivation) => Error::KeyDerivation(message),
            Some(FaultCode::Internal) | None => Error::WorkerError(message),
        })
    }
}

/// What travels on the request queue
#[derive(Debug)]
pub(crate) enum Envelope {
    Request(Request),
    Shutdown,
}
