//! Signer contracts and the signer pool.
//!
//! Signing capacity is modelled as a pool of interchangeable signer
//! instances. Callers borrow one for the duration of a signing operation;
//! when none becomes idle within the borrow timeout the operation fails
//! as temporarily unavailable rather than queueing unboundedly.

pub mod softsigner;

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use bytes::Bytes;

use crate::api::{KeyPair, KeypairGenControl, Name, PublicKey, TbsCertList, TbsCertificate};
use crate::commons::{Error, KilnResult};
use crate::constants::SIGNER_BORROW_TIMEOUT;

//------------ SignerError ---------------------------------------------------

#[derive(Clone, Debug)]
pub enum SignerError {
    KeyGen(String),
    Signing(String),
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignerError::KeyGen(msg) => write!(f, "key generation failed: {}", msg),
            SignerError::Signing(msg) => write!(f, "signing failed: {}", msg),
        }
    }
}

impl std::error::Error for SignerError {}

impl From<openssl::error::ErrorStack> for SignerError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SignerError::Signing(e.to_string())
    }
}

impl From<SignerError> for Error {
    fn from(e: SignerError) -> Self {
        Error::signer(e)
    }
}

//------------ CertSigner ----------------------------------------------------

pub trait CertSigner: Send + Sync {
    fn sign_cert(&self, tbs: &TbsCertificate) -> Result<Bytes, SignerError>;

    fn sign_crl(&self, tbs: &TbsCertList) -> Result<Bytes, SignerError>;

    /// Verifies a signed object against the given public key.
    fn verify(&self, signed: &[u8], key: &PublicKey) -> bool;

    fn public_key(&self) -> &PublicKey;

    fn subject(&self) -> &Name;

    fn is_healthy(&self) -> bool;
}

/// Key pair generation on behalf of a requester.
pub trait KeypairGenerator: Send + Sync {
    fn generate(&self, control: &KeypairGenControl) -> Result<KeyPair, SignerError>;
}

//------------ SignerPool ----------------------------------------------------

/// A fixed set of signer instances with borrow/return semantics.
pub struct SignerPool {
    signers: Vec<Arc<dyn CertSigner>>,
    idle: Mutex<Vec<usize>>,
    available: Condvar,
}

impl SignerPool {
    pub fn new(signers: Vec<Arc<dyn CertSigner>>) -> Self {
        let idle = (0..signers.len()).collect();
        SignerPool {
            signers,
            idle: Mutex::new(idle),
            available: Condvar::new(),
        }
    }

    /// Pool of `capacity` handles onto one shared signer instance.
    pub fn with_capacity(signer: Arc<dyn CertSigner>, capacity: usize) -> Self {
        SignerPool::new((0..capacity.max(1)).map(|_| signer.clone()).collect())
    }

    /// Borrows an idle signer, waiting up to the borrow timeout.
    pub fn borrow(&self) -> KilnResult<SignerHandle<'_>> {
        let deadline = Instant::now() + SIGNER_BORROW_TIMEOUT;
        let mut idle = self
            .idle
            .lock()
            .map_err(|_| Error::system("signer pool lock poisoned"))?;
        loop {
            if let Some(index) = idle.pop() {
                return Ok(SignerHandle { pool: self, index });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::unavailable("no idle signer"));
            }
            idle = self
                .available
                .wait_timeout(idle, deadline - now)
                .map_err(|_| Error::system("signer pool lock poisoned"))?
                .0;
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.signers[0].public_key()
    }

    pub fn subject(&self) -> &Name {
        self.signers[0].subject()
    }

    pub fn verify(&self, signed: &[u8], key: &PublicKey) -> bool {
        self.signers[0].verify(signed, key)
    }

    pub fn is_healthy(&self) -> bool {
        self.signers.iter().all(|signer| signer.is_healthy())
    }
}

impl fmt::Debug for SignerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignerPool")
            .field("capacity", &self.signers.len())
            .finish()
    }
}

/// A borrowed signer. Returns itself to the pool on drop.
pub struct SignerHandle<'a> {
    pool: &'a SignerPool,
    index: usize,
}

impl Deref for SignerHandle<'_> {
    type Target = dyn CertSigner;

    fn deref(&self) -> &Self::Target {
        self.pool.signers[self.index].as_ref()
    }
}

impl Drop for SignerHandle<'_> {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push(self.index);
            self.pool.available.notify_one();
        }
    }
}

//------------ Tests ---------------------------------------------------------
