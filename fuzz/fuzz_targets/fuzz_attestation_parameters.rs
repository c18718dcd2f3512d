#![no_main]

use libfuzzer_sys::fuzz_target;

use enclave_attestation::attestation::AttestationParameters;

fuzz_target!(|data: &[u8]| {
    let Ok(params) = AttestationParameters::deserialize(data) else {
        return;
    };
    // Negative ids decode but are refused on the way out.
    if params.protocol_id < 0 {
        return;
    }
    // Anything that decodes must re-encode to the same bytes.
    let wire = params
        .serialize("FUZZ")
        .expect("decoded parameters re-encode");
    assert_eq!(wire, data);
});
