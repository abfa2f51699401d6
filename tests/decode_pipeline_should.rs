use resolver::resolution::error::{DecodeError, ResolutionError};
use resolver::resolution::pipeline::{DecodePipeline, DecodeStep, KeyRing, ResultValidator};
use resolver::resolution::primitives::{base64_encode, xor_keystream};
use serde_json::json;

const MANIFEST: &str = "https://cdn.example/master.m3u8";

fn steps(value: serde_json::Value) -> Vec<DecodeStep> {
    serde_json::from_value(value).unwrap()
}

fn validator(value: serde_json::Value) -> ResultValidator {
    serde_json::from_value(value).unwrap()
}

fn run(
    steps: &[DecodeStep],
    validator: &ResultValidator,
    input: &[u8],
    keys: &KeyRing,
) -> Result<resolver::resolution::pipeline::DecodedPayload, ResolutionError> {
    DecodePipeline {
        provider_key: "test",
        steps,
        validator,
    }
    .run(input, keys)
}

#[test]
fn test_base64_to_manifest_url() {
    let steps = steps(json!([{ "op": "base64_decode" }]));
    let validator = validator(json!({ "kind": "manifest_url" }));

    let decoded = run(
        &steps,
        &validator,
        base64_encode(MANIFEST.as_bytes(), false).as_bytes(),
        &KeyRing::new(),
    )
    .unwrap();

    assert_eq!(decoded.manifest_url, MANIFEST);
    assert!(decoded.derived_keys.is_empty());
}

#[test]
fn test_wrong_shape_is_a_validation_failure() {
    let steps = steps(json!([{ "op": "base64_decode" }]));
    let validator = validator(json!({ "kind": "manifest_url" }));

    // decodes fine to "encoded", which isn't a url
    let error = run(&steps, &validator, b"ZW5jb2RlZA==", &KeyRing::new()).unwrap_err();

    assert!(matches!(error, ResolutionError::ValidationFailed { .. }));
    assert!(error.is_validation_failure());
    assert!(!error.is_retryable());
}

#[test]
fn test_failing_step_reports_its_index() {
    let steps = steps(json!([
        { "op": "reverse" },
        { "op": "base64_decode", "urlSafe": false },
        { "op": "reverse" }
    ]));
    let validator = validator(json!({ "kind": "manifest_url" }));

    let error = run(&steps, &validator, b"-_-_", &KeyRing::new()).unwrap_err();

    match error {
        ResolutionError::DecodePipelineFailed {
            provider_key,
            step_index,
            cause,
        } => {
            assert_eq!(provider_key, "test");
            assert_eq!(step_index, 1);
            assert_eq!(
                *cause,
                ResolutionError::DecodeStepFailed {
                    step: "base64_decode",
                    reason: DecodeError::InvalidAlphabet('_'),
                }
            );
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_non_utf8_output_fails_validation() {
    let steps = steps(json!([{ "op": "hex_decode" }]));
    let validator = validator(json!({ "kind": "manifest_url" }));

    let error = run(&steps, &validator, b"fffe", &KeyRing::new()).unwrap_err();
    assert!(error.is_validation_failure());
}

#[test]
fn test_derived_keystream_is_returned_then_reused() {
    let key = [0x5a, 0x13, 0x77, 0x21, 0x9c, 0x40];
    let plaintext = format!(r#"{{"sources":["{}"]}}"#, MANIFEST);
    let payload = hex::encode(xor_keystream(plaintext.as_bytes(), &key, true).unwrap());

    let steps = steps(json!([
        { "op": "hex_decode" },
        { "op": "xor_keystream", "key": { "derivedFromKnownPrefix": "{\"sour" } },
        { "op": "json_boundary_scan" }
    ]));
    let validator = validator(json!({ "kind": "json_sources" }));

    let first = run(&steps, &validator, payload.as_bytes(), &KeyRing::new()).unwrap();
    assert_eq!(first.manifest_url, MANIFEST);
    assert_eq!(first.derived_keys, vec![(1, key.to_vec())]);

    // cached key in the ring, nothing new to derive
    let ring: KeyRing = first.derived_keys.into_iter().collect();
    let second = run(&steps, &validator, payload.as_bytes(), &ring).unwrap();
    assert_eq!(second.manifest_url, MANIFEST);
    assert!(second.derived_keys.is_empty());

    // a stale cached key decodes to noise and only the validator notices
    let stale: KeyRing = [(1, vec![0x01, 0x02, 0x03])].into_iter().collect();
    let error = run(&steps, &validator, payload.as_bytes(), &stale).unwrap_err();
    assert!(error.is_validation_failure());
}

#[test]
fn test_json_sources_accepts_objects_and_custom_pointer() {
    let validator = validator(json!({ "kind": "json_sources", "pointer": "/data/streams" }));

    let payload = json!({ "data": { "streams": [{ "file": MANIFEST, "label": "auto" }] } }).to_string();
    assert_eq!(validator.manifest_url(&payload).as_deref(), Some(MANIFEST));

    assert!(!validator.validate(r#"{"data":{"streams":[]}}"#));
    assert!(!validator.validate(r#"{"data":{"streams":["not a url"]}}"#));
    assert!(!validator.validate("garbage"));
}

#[test]
fn test_regex_validator_uses_first_group() {
    let validator = validator(json!({ "kind": "regex", "pattern": "file:\\s*\"([^\"]+)\"" }));

    let payload = format!(r#"jwplayer.setup({{file: "{}", autostart: true}})"#, MANIFEST);
    assert_eq!(validator.manifest_url(&payload).as_deref(), Some(MANIFEST));
    assert!(!validator.validate(r#"file: "/relative/path.m3u8""#));
}

#[test]
fn test_validation_is_idempotent() {
    let validators = [
        validator(json!({ "kind": "manifest_url" })),
        validator(json!({ "kind": "json_sources" })),
        validator(json!({ "kind": "regex", "pattern": "(https://\\S+)" })),
    ];
    let payloads = [
        MANIFEST.to_string(),
        json!({ "sources": [MANIFEST] }).to_string(),
        "nothing here".to_string(),
        "https://".to_string(),
    ];

    for validator in &validators {
        for payload in &payloads {
            assert_eq!(validator.validate(payload), validator.validate(payload));
        }
    }
}

#[test]
fn test_steps_deserialize_key_material() {
    let steps = steps(json!([
        { "op": "aes_cbc_decrypt", "key": "hex:000102030405060708090a0b0c0d0e0f", "iv": "b64:AAAAAAAAAAAAAAAAAAAAAA==" },
        { "op": "xor_keystream", "key": { "fixed": "secret" }, "cycle": false },
        { "op": "caesar_shift", "amount": -3 },
        { "op": "split_join_lookup", "delimiter": "|", "charOffset": 7, "xorKey": "hex:2a" }
    ]));

    assert_eq!(
        steps[0],
        DecodeStep::AesCbcDecrypt {
            key: (0u8..16).collect(),
            iv: vec![0u8; 16],
        }
    );
    assert!(steps.iter().all(|step| step.check().is_ok()));
    assert_eq!(steps[2].name(), "caesar_shift");
}

#[test]
fn test_bad_step_configuration_is_caught() {
    let short_key: DecodeStep =
        serde_json::from_value(json!({ "op": "aes_cbc_decrypt", "key": "short", "iv": "hex:00" })).unwrap();
    assert!(short_key.check().is_err());

    let zero_step: DecodeStep = serde_json::from_value(json!({ "op": "take_every", "step": 0 })).unwrap();
    assert!(zero_step.check().is_err());

    assert!(serde_json::from_value::<DecodeStep>(json!({ "op": "rot_everything" })).is_err());
}
