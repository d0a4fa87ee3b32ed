//! Helpers shared between unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{Duration, Utc};

use crate::api::{
    CaCertData, CaIdentity, CertRecord, CertTemplate, CrlRecord, KeypairGenControl, Name,
    PublicKey, RequestorInfo, RevocationInfo, Serial, TbsCertList,
};
use crate::commons::audit::LogAuditSink;
use crate::commons::crypto::softsigner::OpenSslSigner;
use crate::commons::crypto::{CertSigner, KeypairGenerator, SignerPool};
use crate::commons::store::{CertStore, MemStore};
use crate::config::CaConfig;
use crate::server::ca::profile::CertProfile;
use crate::server::ca::Ca;
use crate::server::publishers::{Publisher, PublisherError, PublisherResult};

pub struct TestCa {
    pub ca: Arc<Ca>,
    pub store: Arc<MemStore>,
}

pub fn test_ca() -> TestCa {
    test_ca_with(CaConfig::default())
}

pub fn test_ca_with(config: CaConfig) -> TestCa {
    let signer = Arc::new(
        OpenSslSigner::generate_new(
            Name::common_name("kiln test ca"),
            &KeypairGenControl::Rsa { key_size: 2048 },
        )
        .unwrap(),
    );
    let store = Arc::new(MemStore::new());
    let ident = CaIdentity::new(1, "testca");
    // the CA certificate takes the first serial of the sequence so that
    // issued certificates never collide with it
    let ca_serial = store.next_serial(&ident).unwrap();
    let ca_cert = CaCertData {
        subject: signer.subject().clone(),
        serial: ca_serial,
        not_before: Utc::now() - Duration::days(1),
        // well past the default ten year max_validity
        not_after: Utc::now() + Duration::days(15 * 365),
        public_key: signer.public_key().clone(),
        cert: Bytes::from_static(b"test-ca-cert"),
    };
    let pool = Arc::new(SignerPool::with_capacity(signer.clone(), 2));
    let keygen: Arc<dyn KeypairGenerator> = signer;
    let ca = Ca::new(
        ident,
        config,
        ca_cert,
        store.clone(),
        pool,
        keygen,
        Arc::new(LogAuditSink),
    )
    .unwrap();
    ca.add_profile(CertProfile::end_entity("tls-server")).unwrap();
    TestCa {
        ca: Arc::new(ca),
        store,
    }
}

/// A structurally valid 1024-bit RSA key, distinct per seed.
pub fn rsa_key(seed: u8) -> PublicKey {
    let mut modulus = vec![0xc1u8; 128];
    modulus[64] = seed;
    modulus[127] = 0x01;
    PublicKey::Rsa {
        modulus,
        exponent: vec![0x01, 0x00, 0x01],
    }
}

pub fn template(cn: &str, key: PublicKey) -> CertTemplate {
    CertTemplate {
        profile: "tls-server".to_string(),
        subject: Name::common_name(cn),
        public_key: Some(key),
        ca_generate_keypair: false,
        not_before: None,
        not_after: None,
        extensions: Vec::new(),
    }
}

pub fn requestor() -> RequestorInfo {
    RequestorInfo::ra("test-ra")
}

/// Unwraps the to-be-signed CRL body from the signed envelope.
pub fn decode_tbs_crl(crl: &CrlRecord) -> TbsCertList {
    let value: serde_json::Value = serde_json::from_slice(&crl.crl).unwrap();
    serde_json::from_str(value["tbs"].as_str().unwrap()).unwrap()
}

//------------ RecordingPublisher --------------------------------------------

/// A publisher that records every callback and can be told to fail.
pub struct RecordingPublisher {
    ident: String,
    async_mode: bool,
    fail: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn new(ident: &str) -> Arc<Self> {
        Arc::new(RecordingPublisher {
            ident: ident.to_string(),
            async_mode: false,
            fail: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn new_async(ident: &str) -> Arc<Self> {
        Arc::new(RecordingPublisher {
            ident: ident.to_string(),
            async_mode: true,
            fail: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) -> PublisherResult {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublisherError::new("forced failure"));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl Publisher for RecordingPublisher {
    fn ident(&self) -> &str {
        &self.ident
    }

    fn is_async(&self) -> bool {
        self.async_mode
    }

    fn is_healthy(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    fn certificate_added(&self, cert: &CertRecord) -> PublisherResult {
        self.record(format!("cert_added {}", cert.serial))
    }

    fn certificate_revoked(
        &self,
        cert: &CertRecord,
        revocation: &RevocationInfo,
    ) -> PublisherResult {
        self.record(format!("cert_revoked {} {}", cert.serial, revocation.reason))
    }

    fn certificate_unrevoked(&self, cert: &CertRecord) -> PublisherResult {
        self.record(format!("cert_unrevoked {}", cert.serial))
    }

    fn certificate_removed(&self, cert: &CertRecord) -> PublisherResult {
        self.record(format!("cert_removed {}", cert.serial))
    }

    fn crl_added(&self, crl: &CrlRecord) -> PublisherResult {
        self.record(format!("crl_added {}", crl.number))
    }

    fn ca_added(&self, _ca_cert: &[u8]) -> PublisherResult {
        self.record("ca_added".to_string())
    }

    fn ca_revoked(&self, serial: Serial, revocation: &RevocationInfo) -> PublisherResult {
        self.record(format!("ca_revoked {} {}", serial, revocation.reason))
    }

    fn ca_unrevoked(&self, serial: Serial) -> PublisherResult {
        self.record(format!("ca_unrevoked {}", serial))
    }
}
