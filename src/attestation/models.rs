//! Binary models of the attestation info returned by the server.

use bytes::{BufMut, BytesMut};

use crate::error::{AttestError, WireError};
use crate::wire::{size_field, Reader};

use super::EnclaveType;

const LONG_ID_LEN: usize = 32;
const SHORT_ID_LEN: usize = 16;
const ENCLAVE_DATA_LEN: usize = 64;

impl From<WireError> for AttestError {
    fn from(e: WireError) -> Self {
        AttestError::MalformedInfo(e.to_string())
    }
}

/// `u32 keySize | u32 signatureSize | key | signature`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveDhInfo {
    /// Enclave ECDH public key as a `BCRYPT_ECCKEY_BLOB`.
    pub public_key: Vec<u8>,
    /// Signature over `public_key` by the enclave's identity key.
    pub public_key_signature: Vec<u8>,
}

impl EnclaveDhInfo {
    pub fn parse(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let key_len = r.read_u32("dhPublicKeySize")? as usize;
        let sig_len = r.read_u32("dhPublicKeySignatureSize")? as usize;
        Ok(Self {
            public_key: r.take("dhPublicKey", key_len)?.to_vec(),
            public_key_signature: r.take("dhPublicKeySignature", sig_len)?.to_vec(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, enclave_type: &str) -> Result<(), WireError> {
        buf.put_u32_le(size_field("dhPublicKeySize", self.public_key.len(), enclave_type)?);
        buf.put_u32_le(size_field(
            "dhPublicKeySignatureSize",
            self.public_key_signature.len(),
            enclave_type,
        )?);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.public_key_signature);
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.public_key.len() + self.public_key_signature.len()
    }
}

/// `VBS_ENCLAVE_REPORT_PKG_HEADER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportPackageHeader {
    pub package_size: u32,
    pub version: u32,
    pub signature_scheme: u32,
    pub signed_statement_size: u32,
    pub signature_size: u32,
    pub reserved: u32,
}

impl ReportPackageHeader {
    pub const SIZE: usize = 6 * 4;

    /// Header for a package holding a statement and signature of the given sizes.
    pub fn for_parts(statement_len: usize, signature_len: usize) -> Result<Self, WireError> {
        let package_len = Self::SIZE
            .saturating_add(statement_len)
            .saturating_add(signature_len);
        Ok(Self {
            package_size: size_field("packageSize", package_len, "VBS")?,
            version: 1,
            signature_scheme: 1,
            signed_statement_size: size_field("signedStatementSize", statement_len, "VBS")?,
            signature_size: size_field("signatureSize", signature_len, "VBS")?,
            reserved: 0,
        })
    }

    fn parse(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            package_size: r.read_u32("packageSize")?,
            version: r.read_u32("version")?,
            signature_scheme: r.read_u32("signatureScheme")?,
            signed_statement_size: r.read_u32("signedStatementSize")?,
            signature_size: r.read_u32("signatureSize")?,
            reserved: r.read_u32("reserved")?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.package_size);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.signature_scheme);
        buf.put_u32_le(self.signed_statement_size);
        buf.put_u32_le(self.signature_size);
        buf.put_u32_le(self.reserved);
    }
}

/// `ENCLAVE_IDENTITY`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnclaveIdentity {
    pub owner_id: [u8; LONG_ID_LEN],
    pub unique_id: [u8; LONG_ID_LEN],
    pub author_id: [u8; LONG_ID_LEN],
    pub family_id: [u8; SHORT_ID_LEN],
    pub image_id: [u8; SHORT_ID_LEN],
    pub enclave_svn: u32,
    pub secure_kernel_svn: u32,
    pub platform_svn: u32,
    pub flags: u32,
    pub signing_level: u32,
    pub reserved: u32,
}

impl EnclaveIdentity {
    pub const SIZE: usize = 3 * LONG_ID_LEN + 2 * SHORT_ID_LEN + 6 * 4;

    fn parse(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            owner_id: r.take_array("ownerId")?,
            unique_id: r.take_array("uniqueId")?,
            author_id: r.take_array("authorId")?,
            family_id: r.take_array("familyId")?,
            image_id: r.take_array("imageId")?,
            enclave_svn: r.read_u32("enclaveSvn")?,
            secure_kernel_svn: r.read_u32("secureKernelSvn")?,
            platform_svn: r.read_u32("platformSvn")?,
            flags: r.read_u32("flags")?,
            signing_level: r.read_u32("signingLevel")?,
            reserved: r.read_u32("reserved")?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.owner_id);
        buf.put_slice(&self.unique_id);
        buf.put_slice(&self.author_id);
        buf.put_slice(&self.family_id);
        buf.put_slice(&self.image_id);
        buf.put_u32_le(self.enclave_svn);
        buf.put_u32_le(self.secure_kernel_svn);
        buf.put_u32_le(self.platform_svn);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.signing_level);
        buf.put_u32_le(self.reserved);
    }
}

/// `VBS_ENCLAVE_REPORT`. Trailing module records are not parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveReport {
    pub report_size: u32,
    pub report_version: u32,
    pub enclave_data: [u8; ENCLAVE_DATA_LEN],
    pub identity: EnclaveIdentity,
}

impl EnclaveReport {
    pub const SIZE: usize = 2 * 4 + ENCLAVE_DATA_LEN + EnclaveIdentity::SIZE;

    fn parse(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            report_size: r.read_u32("reportSize")?,
            report_version: r.read_u32("reportVersion")?,
            enclave_data: r.take_array("enclaveData")?,
            identity: EnclaveIdentity::parse(r)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.report_size);
        buf.put_u32_le(self.report_version);
        buf.put_slice(&self.enclave_data);
        self.identity.encode(&mut buf);
        buf.to_vec()
    }
}

/// Output of `EnclaveGetAttestationReport`: header, report, signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveReportPackage {
    pub header: ReportPackageHeader,
    pub report: EnclaveReport,
    /// The signed statement, starting at the report.
    pub report_bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

impl EnclaveReportPackage {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let header = ReportPackageHeader::parse(&mut r)?;
        let report = EnclaveReport::parse(&mut r)?;

        // The signed statement re-reads the report from just after the header.
        let mut r = Reader::new(payload);
        r.take("header", ReportPackageHeader::SIZE)?;
        let report_bytes = r
            .take("signedStatement", header.signed_statement_size as usize)?
            .to_vec();
        let signature = r.take("signature", header.signature_size as usize)?.to_vec();

        Ok(Self {
            header,
            report,
            report_bytes,
            signature,
        })
    }

    /// Build a package from a signed statement and its signature.
    pub fn encode(report_bytes: &[u8], signature: &[u8]) -> Result<Vec<u8>, WireError> {
        let header = ReportPackageHeader::for_parts(report_bytes.len(), signature.len())?;
        let mut buf = BytesMut::with_capacity(header.package_size as usize);
        header.encode(&mut buf);
        buf.put_slice(report_bytes);
        buf.put_slice(signature);
        Ok(buf.to_vec())
    }

    /// Whether the header's declared package size matches its parts.
    pub fn is_well_formed(&self) -> bool {
        let calculated = ReportPackageHeader::SIZE as u64
            + self.header.signed_statement_size as u64
            + self.header.signature_size as u64;
        calculated == self.header.package_size as u64
    }
}

/// Attestation info returned by a VBS enclave attested through HGS.
#[derive(Debug, Clone)]
pub struct HgsAttestationInfo {
    pub total_size: u32,
    /// Enclave RSA public key as a `BCRYPT_RSAKEY_BLOB`.
    pub identity: Vec<u8>,
    /// DER-encoded host health certificate.
    pub health_report: Vec<u8>,
    pub report_package: EnclaveReportPackage,
    pub session_id: i64,
    pub dh_info: EnclaveDhInfo,
}

impl HgsAttestationInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, AttestError> {
        let mut r = Reader::new(buf);
        let total_size = r.read_u32("totalSize")?;
        let identity_size = r.read_u32("identitySize")? as usize;
        let health_report_size = r.read_u32("healthReportSize")? as usize;
        let report_size = r.read_u32("enclaveReportSize")? as usize;

        let identity = r.take("identity", identity_size)?.to_vec();
        let health_report = r.take("healthReport", health_report_size)?.to_vec();
        let report_package = EnclaveReportPackage::parse(r.take("enclaveReport", report_size)?)?;

        let _secure_session_info_size = r.read_u32("secureSessionInfoSize")?;
        let session_id = r.read_i64("sessionId")?;
        let dh_info = EnclaveDhInfo::parse(&mut r)?;

        if r.remaining() != 0 {
            tracing::debug!(
                trailing = r.remaining(),
                "ignoring trailing bytes after attestation info"
            );
        }

        Ok(Self {
            total_size,
            identity,
            health_report,
            report_package,
            session_id,
            dh_info,
        })
    }

    /// Serialize attestation info in the layout the server sends.
    pub fn encode(
        identity: &[u8],
        health_report: &[u8],
        report_package: &[u8],
        session_id: i64,
        dh_info: &EnclaveDhInfo,
    ) -> Result<Vec<u8>, WireError> {
        let secure_session_size = 8 + dh_info.encoded_len();
        let total = 16 + identity.len() + health_report.len() + report_package.len() + 4
            + secure_session_size;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(size_field("totalSize", total, "VBS")?);
        buf.put_u32_le(size_field("identitySize", identity.len(), "VBS")?);
        buf.put_u32_le(size_field("healthReportSize", health_report.len(), "VBS")?);
        buf.put_u32_le(size_field("enclaveReportSize", report_package.len(), "VBS")?);
        buf.put_slice(identity);
        buf.put_slice(health_report);
        buf.put_slice(report_package);
        buf.put_u32_le(size_field("secureSessionInfoSize", secure_session_size, "VBS")?);
        buf.put_i64_le(session_id);
        dh_info.encode(&mut buf, "VBS")?;
        Ok(buf.to_vec())
    }
}

/// Attestation info returned when the enclave was attested by AAS.
#[derive(Debug, Clone)]
pub struct AasAttestationInfo {
    pub total_size: u32,
    pub enclave_type: EnclaveType,
    /// Enclave RSA public key as a `BCRYPT_RSAKEY_BLOB`.
    pub identity: Vec<u8>,
    /// Compact JWS issued by the attestation service.
    pub attestation_token: String,
    pub session_id: i64,
    pub dh_info: EnclaveDhInfo,
}

impl AasAttestationInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, AttestError> {
        let mut r = Reader::new(buf);
        let total_size = r.read_u32("totalSize")?;
        let identity_size = r.read_u32("identitySize")? as usize;
        let token_size = r.read_u32("attestationTokenSize")? as usize;
        let raw_type = r.read_u32("enclaveType")?;
        let enclave_type = EnclaveType::from_wire(raw_type).ok_or_else(|| {
            AttestError::MalformedInfo(format!("unknown enclave type {raw_type}"))
        })?;

        let identity = r.take("identity", identity_size)?.to_vec();
        let token = r.take("attestationToken", token_size)?;
        let attestation_token = String::from_utf8_lossy(token)
            .trim()
            .trim_matches('"')
            .to_string();

        let secure_session_size = r.read_u32("secureSessionInfoSize")? as usize;
        let session_id = r.read_i64("sessionId")?;
        // The declared size covers the DH info plus a u32; tolerate a short tail.
        let dh_len = secure_session_size.saturating_sub(4).min(r.remaining());
        let mut dh = Reader::new(r.take("secureSessionInfo", dh_len)?);
        let dh_info = EnclaveDhInfo::parse(&mut dh)?;

        Ok(Self {
            total_size,
            enclave_type,
            identity,
            attestation_token,
            session_id,
            dh_info,
        })
    }

    pub fn encode(
        enclave_type: EnclaveType,
        identity: &[u8],
        token: &str,
        session_id: i64,
        dh_info: &EnclaveDhInfo,
    ) -> Result<Vec<u8>, WireError> {
        let kind = enclave_type.as_str();
        let secure_session_size = 4 + dh_info.encoded_len();
        let total = 16 + identity.len() + token.len() + 4 + 8 + dh_info.encoded_len();

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(size_field("totalSize", total, kind)?);
        buf.put_u32_le(size_field("identitySize", identity.len(), kind)?);
        buf.put_u32_le(size_field("attestationTokenSize", token.len(), kind)?);
        buf.put_u32_le(enclave_type as u32);
        buf.put_slice(identity);
        buf.put_slice(token.as_bytes());
        buf.put_u32_le(size_field("secureSessionInfoSize", secure_session_size, kind)?);
        buf.put_i64_le(session_id);
        dh_info.encode(&mut buf, kind)?;
        Ok(buf.to_vec())
    }
}

/// Attestation info returned when no attestation is requested:
/// `dhInfo | i64 sessionId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoneAttestationInfo {
    pub dh_info: EnclaveDhInfo,
    pub session_id: i64,
}

impl NoneAttestationInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, AttestError> {
        let mut r = Reader::new(buf);
        let dh_info = EnclaveDhInfo::parse(&mut r)?;
        let session_id = r.read_i64("sessionId")?;
        Ok(Self {
            dh_info,
            session_id,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(self.dh_info.encoded_len() + 8);
        self.dh_info.encode(&mut buf, "NONE")?;
        buf.put_i64_le(self.session_id);
        Ok(buf.to_vec())
    }
}
