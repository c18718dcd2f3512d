#![no_main]

use libfuzzer_sys::fuzz_target;

use enclave_attestation::attestation::models::{
    AasAttestationInfo, HgsAttestationInfo, NoneAttestationInfo,
};

fuzz_target!(|data: &[u8]| {
    // Server-supplied attestation info: parse errors are fine, panics are not.
    let _ = HgsAttestationInfo::parse(data);
    let _ = NoneAttestationInfo::parse(data);
    if let Ok(info) = AasAttestationInfo::parse(data) {
        assert!(info.identity.len() <= data.len());
    }
});
