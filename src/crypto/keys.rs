//! Client Diffie-Hellman keys and conversion of Windows CNG key blobs.
//!
//! The enclave exchanges keys as `BCRYPT_ECCKEY_BLOB` (ECDH P-384 public)
//! and `BCRYPT_RSAKEY_BLOB` (RSA public) structures. Header integers are
//! little-endian; RSA exponent and modulus are big-endian.

use bytes::{BufMut, BytesMut};
use openssl::bn::{BigNum, BigNumContext};
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Verifier;
use sha2::{Digest, Sha256};

use super::{key_agreement_err, P384_COORD_LEN};
use crate::error::CryptoError;
use crate::wire::{size_field, Reader};

/// `BCRYPT_ECDH_PUBLIC_P384_MAGIC` ("ECK3").
pub const ECDH_P384_PUBLIC_MAGIC: u32 = 0x334B_4345;

/// `BCRYPT_RSAPUBLIC_MAGIC` ("RSA1").
pub const RSA_PUBLIC_MAGIC: u32 = 0x3141_5352;

/// Size of an ECC P-384 public blob: header plus X and Y.
pub const ECC_P384_BLOB_LEN: usize = 8 + 2 * P384_COORD_LEN;

const RSA_BLOB_HEADER_LEN: usize = 24;

fn blob_err(kind: &'static str, reason: impl Into<String>) -> CryptoError {
    CryptoError::InvalidKeyBlob {
        kind,
        reason: reason.into(),
    }
}

fn p384_group() -> Result<EcGroup, CryptoError> {
    EcGroup::from_curve_name(Nid::SECP384R1).map_err(key_agreement_err("P-384 group"))
}

/// Ephemeral ECDH P-384 key pair generated per attestation attempt.
pub struct DhKeyPair {
    key: EcKey<Private>,
}

impl DhKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let group = p384_group()?;
        let key = EcKey::generate(&group).map_err(key_agreement_err("generate P-384 key"))?;
        Ok(Self { key })
    }

    /// The public half as a `BCRYPT_ECCKEY_BLOB`.
    pub fn public_blob(&self) -> Result<Vec<u8>, CryptoError> {
        let public = EcKey::from_public_key(self.key.group(), self.key.public_key())
            .map_err(key_agreement_err("extract public key"))?;
        ecc_public_key_to_blob(&public)
    }

    /// ECDH with the peer's public blob, hashed with SHA-256.
    ///
    /// Matches CNG's `DeriveKeyFromHash(SHA256)`: the digest of the shared
    /// x-coordinate.
    pub fn derive_key_from_hash(&self, peer_blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer = ecc_public_blob_to_key(peer_blob)?;
        let ours = PKey::from_ec_key(self.key.clone()).map_err(key_agreement_err("wrap key"))?;
        let theirs = PKey::from_ec_key(peer).map_err(key_agreement_err("wrap peer key"))?;

        let mut deriver = Deriver::new(&ours).map_err(key_agreement_err("deriver"))?;
        deriver
            .set_peer(&theirs)
            .map_err(key_agreement_err("set peer"))?;
        let shared = deriver
            .derive_to_vec()
            .map_err(key_agreement_err("derive"))?;
        Ok(Sha256::digest(&shared).to_vec())
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair").finish_non_exhaustive()
    }
}

/// Encode a P-384 public key as a `BCRYPT_ECCKEY_BLOB`.
pub fn ecc_public_key_to_blob(key: &EcKey<Public>) -> Result<Vec<u8>, CryptoError> {
    let group = key.group();
    let mut ctx = BigNumContext::new().map_err(key_agreement_err("bn context"))?;
    let mut x = BigNum::new().map_err(key_agreement_err("bn"))?;
    let mut y = BigNum::new().map_err(key_agreement_err("bn"))?;
    key.public_key()
        .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)
        .map_err(key_agreement_err("affine coordinates"))?;

    let coord_len = P384_COORD_LEN as i32;
    let x = x.to_vec_padded(coord_len).map_err(key_agreement_err("pad x"))?;
    let y = y.to_vec_padded(coord_len).map_err(key_agreement_err("pad y"))?;

    let mut buf = BytesMut::with_capacity(ECC_P384_BLOB_LEN);
    buf.put_u32_le(ECDH_P384_PUBLIC_MAGIC);
    buf.put_u32_le(P384_COORD_LEN as u32);
    buf.put_slice(&x);
    buf.put_slice(&y);
    Ok(buf.to_vec())
}

/// Decode a `BCRYPT_ECCKEY_BLOB` into a P-384 public key.
///
/// The point is validated to lie on the curve.
pub fn ecc_public_blob_to_key(blob: &[u8]) -> Result<EcKey<Public>, CryptoError> {
    if blob.len() != ECC_P384_BLOB_LEN {
        return Err(blob_err(
            "ECC",
            format!("expected {ECC_P384_BLOB_LEN} bytes, got {}", blob.len()),
        ));
    }
    let mut r = Reader::new(blob);
    let magic = r.read_u32("magic").map_err(|e| blob_err("ECC", e.to_string()))?;
    if magic != ECDH_P384_PUBLIC_MAGIC {
        return Err(blob_err("ECC", format!("unexpected magic 0x{magic:08X}")));
    }
    let key_len = r.read_u32("cbKey").map_err(|e| blob_err("ECC", e.to_string()))?;
    if key_len as usize != P384_COORD_LEN {
        return Err(blob_err("ECC", format!("unexpected key length {key_len}")));
    }
    let coords = r.rest();
    let x = BigNum::from_slice(&coords[..P384_COORD_LEN]).map_err(key_agreement_err("x"))?;
    let y = BigNum::from_slice(&coords[P384_COORD_LEN..]).map_err(key_agreement_err("y"))?;

    let group = p384_group()?;
    EcKey::from_public_key_affine_coordinates(&group, &x, &y)
        .map_err(|e| blob_err("ECC", format!("point is not on P-384: {e}")))
}

/// Decode a `BCRYPT_RSAKEY_BLOB` holding an RSA public key.
pub fn rsa_public_blob_to_key(blob: &[u8]) -> Result<Rsa<Public>, CryptoError> {
    let mut r = Reader::new(blob);
    let mut header = || -> Result<[u32; 6], crate::error::WireError> {
        Ok([
            r.read_u32("magic")?,
            r.read_u32("bitLength")?,
            r.read_u32("cbPublicExp")?,
            r.read_u32("cbModulus")?,
            r.read_u32("cbPrime1")?,
            r.read_u32("cbPrime2")?,
        ])
    };
    let [magic, _bit_len, exp_len, mod_len, _, _] =
        header().map_err(|e| blob_err("RSA", e.to_string()))?;
    if magic != RSA_PUBLIC_MAGIC {
        return Err(blob_err("RSA", format!("unexpected magic 0x{magic:08X}")));
    }

    let exponent = r
        .take("publicExponent", exp_len as usize)
        .map_err(|e| blob_err("RSA", e.to_string()))?;
    let modulus = r
        .take("modulus", mod_len as usize)
        .map_err(|e| blob_err("RSA", e.to_string()))?;

    let n = BigNum::from_slice(modulus).map_err(|e| blob_err("RSA", e.to_string()))?;
    let e = BigNum::from_slice(exponent).map_err(|e| blob_err("RSA", e.to_string()))?;
    Rsa::from_public_components(n, e).map_err(|e| blob_err("RSA", e.to_string()))
}

/// Encode an RSA public key as a `BCRYPT_RSAKEY_BLOB`.
pub fn rsa_public_key_to_blob<T>(key: &Rsa<T>) -> Result<Vec<u8>, CryptoError>
where
    T: openssl::pkey::HasPublic,
{
    let field = |name: &'static str, size: usize| {
        size_field(name, size, "RSA").map_err(|e| blob_err("RSA", e.to_string()))
    };
    let exponent = key.e().to_vec();
    let modulus = key.n().to_vec();
    let bit_length = usize::try_from(key.n().num_bits()).unwrap_or(usize::MAX);
    let mut buf = BytesMut::with_capacity(RSA_BLOB_HEADER_LEN + exponent.len() + modulus.len());
    buf.put_u32_le(RSA_PUBLIC_MAGIC);
    buf.put_u32_le(field("bitLength", bit_length)?);
    buf.put_u32_le(field("publicExponentSize", exponent.len())?);
    buf.put_u32_le(field("modulusSize", modulus.len())?);
    buf.put_u32_le(0);
    buf.put_u32_le(0);
    buf.put_slice(&exponent);
    buf.put_slice(&modulus);
    Ok(buf.to_vec())
}

/// Which RSA signature padding a verification uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaSignaturePadding {
    Pkcs1,
    Pss,
}

/// Verify an RSA/SHA-256 signature over `data`.
///
/// Returns `Ok(false)` for a well-formed but wrong signature.
pub fn verify_rsa_sha256(
    key: &PKey<Public>,
    padding: RsaSignaturePadding,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    let mut verifier =
        Verifier::new(MessageDigest::sha256(), key).map_err(key_agreement_err("verifier"))?;
    if padding == RsaSignaturePadding::Pss {
        verifier
            .set_rsa_padding(Padding::PKCS1_PSS)
            .map_err(key_agreement_err("pss padding"))?;
        verifier
            .set_rsa_pss_saltlen(openssl::sign::RsaPssSaltlen::DIGEST_LENGTH)
            .map_err(key_agreement_err("pss salt length"))?;
    }
    verifier
        .update(data)
        .map_err(key_agreement_err("verifier update"))?;
    // A malformed signature surfaces as an error stack; treat it as a mismatch.
    Ok(verifier.verify(signature).unwrap_or(false))
}
