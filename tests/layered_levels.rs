//! Properties of the application-layer layered cipher.

use std::num::NonZeroU32;

use proptest::prelude::*;
use serde_json::{json, Value};

use sealwire::{LayeredCipher, LayeredError, LayeredValue, Secret, TransportConfig};

fn cipher() -> LayeredCipher {
    LayeredCipher::new(
        Secret::new("layered-test-secret"),
        NonZeroU32::new(100).unwrap(),
        5,
    )
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        ".{0,40}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_decrypt_inverts_encrypt(value in json_value(), level in 0u32..=3) {
        let cipher = cipher();
        let token = cipher.encrypt(&value, level).unwrap();
        prop_assert_eq!(
            cipher.decrypt(&token, level).unwrap(),
            LayeredValue::Structured(value)
        );
    }
}

#[test]
fn test_encrypt_is_non_deterministic_for_every_level() {
    let cipher = cipher();
    let value = json!({"msg": "hello"});
    for level in 1..=3 {
        let a = cipher.encrypt(&value, level).unwrap();
        let b = cipher.encrypt(&value, level).unwrap();
        assert_ne!(a, b, "level {level} produced identical tokens");
    }
}

#[test]
fn test_token_grows_with_level() {
    let cipher = cipher();
    let value = json!({"msg": "hello"});
    let lengths: Vec<usize> = (0..=3)
        .map(|level| cipher.encrypt(&value, level).unwrap().len())
        .collect();
    assert!(lengths.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_each_round_needs_the_shared_secret() {
    let token = cipher().encrypt(&json!("secret"), 3).unwrap();
    let intruder = LayeredCipher::new(Secret::new("guess"), NonZeroU32::new(100).unwrap(), 5);
    assert_eq!(intruder.decrypt(&token, 3), Err(LayeredError::DecryptError));
}

#[test]
fn test_config_cipher_uses_application_secret() {
    let config = TransportConfig::default();
    let a = LayeredCipher::from_config(&config);
    let b = LayeredCipher::from_config(&config);
    let token = a.encrypt(&json!({"k": 1}), 2).unwrap();
    assert_eq!(b.decrypt(&token, 2).unwrap().into_value(), json!({"k": 1}));

    let other = LayeredCipher::from_config(&TransportConfig {
        application_secret: Secret::new("rotated"),
        ..TransportConfig::default()
    });
    assert_eq!(other.decrypt(&token, 2), Err(LayeredError::DecryptError));
}
