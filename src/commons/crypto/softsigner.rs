//! An OpenSSL-backed software signer.
//!
//! Signing wraps the serialized to-be-signed structure in a small JSON
//! envelope together with the algorithm name and the hex signature. The
//! serialized TBS is embedded verbatim as a string so that verification
//! operates on the exact bytes that were signed.

use bytes::Bytes;
use log::debug;
use openssl::bn::{BigNum, BigNumContext};
use openssl::dsa::Dsa;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::api::{EcCurve, KeyPair, KeypairGenControl, Name, PublicKey};
use crate::commons::crypto::{CertSigner, KeypairGenerator, SignerError};

//------------ SignedObject --------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct SignedObject {
    alg: String,
    tbs: String,
    sig: String,
}

//------------ OpenSslSigner -------------------------------------------------

pub struct OpenSslSigner {
    pkey: PKey<Private>,
    subject: Name,
    public: PublicKey,
    alg: &'static str,
}

impl OpenSslSigner {
    /// Creates a signer with a freshly generated key.
    pub fn generate_new(
        subject: Name,
        control: &KeypairGenControl,
    ) -> Result<Self, SignerError> {
        let (pkey, public) = generate_pkey(control)?;
        debug!("generated {} signing key for '{}'", public.algorithm(), subject);
        let alg = alg_for(&public);
        Ok(OpenSslSigner {
            pkey,
            subject,
            public,
            alg,
        })
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>, SignerError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        Ok(signer.sign_oneshot_to_vec(data)?)
    }

    fn sign_envelope<T: Serialize>(&self, tbs: &T) -> Result<Bytes, SignerError> {
        let tbs = serde_json::to_string(tbs)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let sig = hex::encode(self.sign_bytes(tbs.as_bytes())?);
        let object = SignedObject {
            alg: self.alg.to_string(),
            tbs,
            sig,
        };
        let encoded = serde_json::to_vec(&object)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }
}

impl CertSigner for OpenSslSigner {
    fn sign_cert(
        &self,
        tbs: &crate::api::TbsCertificate,
    ) -> Result<Bytes, SignerError> {
        self.sign_envelope(tbs)
    }

    fn sign_crl(&self, tbs: &crate::api::TbsCertList) -> Result<Bytes, SignerError> {
        self.sign_envelope(tbs)
    }

    fn verify(&self, signed: &[u8], key: &PublicKey) -> bool {
        let object: SignedObject = match serde_json::from_slice(signed) {
            Ok(object) => object,
            Err(_) => return false,
        };
        let sig = match hex::decode(&object.sig) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let pkey = match public_pkey(key) {
            Ok(pkey) => pkey,
            Err(_) => return false,
        };
        Verifier::new(MessageDigest::sha256(), &pkey)
            .and_then(|mut verifier| verifier.verify_oneshot(&sig, object.tbs.as_bytes()))
            .unwrap_or(false)
    }

    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn subject(&self) -> &Name {
        &self.subject
    }

    fn is_healthy(&self) -> bool {
        // a throwaway signature proves the key is usable
        self.sign_bytes(b"health").is_ok()
    }
}

impl KeypairGenerator for OpenSslSigner {
    fn generate(&self, control: &KeypairGenControl) -> Result<KeyPair, SignerError> {
        let (pkey, public) = generate_pkey(control)?;
        let private = pkey.private_key_to_der()?;
        Ok(KeyPair { public, private })
    }
}

//------------ Key material helpers ------------------------------------------

fn alg_for(key: &PublicKey) -> &'static str {
    match key {
        PublicKey::Rsa { .. } => "SHA256withRSA",
        PublicKey::Ec { .. } => "SHA256withECDSA",
        PublicKey::Dsa { .. } => "SHA256withDSA",
    }
}

fn curve_nid(curve: EcCurve) -> Nid {
    match curve {
        EcCurve::P256 => Nid::X9_62_PRIME256V1,
        EcCurve::P384 => Nid::SECP384R1,
        EcCurve::P521 => Nid::SECP521R1,
    }
}

fn generate_pkey(
    control: &KeypairGenControl,
) -> Result<(PKey<Private>, PublicKey), SignerError> {
    match control {
        KeypairGenControl::Rsa { key_size } => {
            let rsa = Rsa::generate(*key_size)?;
            let public = PublicKey::Rsa {
                modulus: rsa.n().to_vec(),
                exponent: rsa.e().to_vec(),
            };
            Ok((PKey::from_rsa(rsa)?, public))
        }
        KeypairGenControl::Ec { curve } => {
            let group = EcGroup::from_curve_name(curve_nid(*curve))?;
            let key = EcKey::generate(&group)?;
            let mut ctx = BigNumContext::new()?;
            let point =
                key.public_key()
                    .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
            let public = PublicKey::Ec {
                curve: *curve,
                point,
            };
            Ok((PKey::from_ec_key(key)?, public))
        }
        KeypairGenControl::Dsa { key_size } => {
            let dsa = Dsa::generate(*key_size)?;
            let public = PublicKey::Dsa {
                p: dsa.p().to_vec(),
                q: dsa.q().to_vec(),
                g: dsa.g().to_vec(),
                y: dsa.pub_key().to_vec(),
            };
            Ok((PKey::from_dsa(dsa)?, public))
        }
        KeypairGenControl::Forbidden | KeypairGenControl::InheritCa => Err(
            SignerError::KeyGen("keypair generation control not resolved".to_string()),
        ),
    }
}

fn public_pkey(key: &PublicKey) -> Result<PKey<Public>, ErrorStack> {
    match key {
        PublicKey::Rsa { modulus, exponent } => {
            let rsa = Rsa::from_public_components(
                BigNum::from_slice(modulus)?,
                BigNum::from_slice(exponent)?,
            )?;
            PKey::from_rsa(rsa)
        }
        PublicKey::Ec { curve, point } => {
            let group = EcGroup::from_curve_name(curve_nid(*curve))?;
            let mut ctx = BigNumContext::new()?;
            let point = EcPoint::from_bytes(&group, point, &mut ctx)?;
            let key = EcKey::from_public_key(&group, &point)?;
            PKey::from_ec_key(key)
        }
        PublicKey::Dsa { p, q, g, y } => {
            let dsa = Dsa::from_public_components(
                BigNum::from_slice(p)?,
                BigNum::from_slice(q)?,
                BigNum::from_slice(g)?,
                BigNum::from_slice(y)?,
            )?;
            PKey::from_dsa(dsa)
        }
    }
}

//------------ Tests ---------------------------------------------------------
