//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check codec, keying and store invariants over random input.

use num_bigint::BigInt;
use proptest::prelude::*;
use serde_json::json;
use std::thread::sleep;
use std::time::Duration;

use crate::cache::keys::{self, HashAlgorithm};
use crate::cache::value::{decode_record, encode_record, serialize, unserialize};
use crate::cache::{
    CacheDriver, CacheEntry, CacheOptions, DriverConfig, MemoryDriver, MemoryStore, TypedValue,
};
use crate::error::CacheError;

// == Strategies ==
/// Generates valid cache keys (non-empty)
fn valid_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_:]{1,64}".prop_map(|s| s)
}

fn namespace_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,16}".prop_map(|s| s)
}

fn algorithm_strategy() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![
        Just(HashAlgorithm::Md5),
        Just(HashAlgorithm::Sha1),
        Just(HashAlgorithm::Sha256),
    ]
}

/// Generates every storable value kind
fn typed_value_strategy() -> impl Strategy<Value = TypedValue> {
    prop_oneof![
        Just(TypedValue::Null),
        any::<bool>().prop_map(TypedValue::Boolean),
        (-1.0e15f64..1.0e15f64).prop_map(TypedValue::Number),
        ".*".prop_map(TypedValue::String),
        any::<i128>().prop_map(|n| TypedValue::BigInt(BigInt::from(n))),
        ("[a-z]{1,8}", any::<i32>()).prop_map(|(k, v)| {
            let mut map = serde_json::Map::new();
            map.insert("nested".to_string(), json!([v, null]));
            map.insert(k, json!(v));
            TypedValue::Object(map)
        }),
        prop::collection::vec(any::<bool>(), 0..8)
            .prop_map(|items| TypedValue::from(json!(items))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Serializing then unserializing with the recorded code yields the same value.
    #[test]
    fn prop_codec_round_trip(value in typed_value_strategy()) {
        let (data_type, payload) = serialize(&value).unwrap();
        prop_assert_eq!(data_type, value.data_type());
        let decoded = unserialize(&payload, data_type.code() as i64).unwrap();
        prop_assert_eq!(decoded, value);
    }

    // Records survive payloads that contain the separator.
    #[test]
    fn prop_record_round_trip(value in typed_value_strategy()) {
        let record = encode_record(&value).unwrap();
        prop_assert_eq!(decode_record(&record).unwrap(), value);
    }

    // Distinct namespaces never map one key to the same storage key.
    #[test]
    fn prop_namespace_isolation(
        key in valid_key_strategy(),
        ns_a in namespace_strategy(),
        ns_b in namespace_strategy(),
        algorithm in algorithm_strategy()
    ) {
        prop_assume!(ns_a != ns_b);
        let a = DriverConfig::new().with_namespace(ns_a).with_hash_algorithm(algorithm);
        let b = DriverConfig::new().with_namespace(ns_b).with_hash_algorithm(algorithm);

        let key_a = a.storage_key(&key, false).unwrap();
        let key_b = b.storage_key(&key, false).unwrap();
        prop_assert_ne!(&key_a, &key_b);

        let mut store = MemoryStore::new();
        store.insert(key_a.clone(), CacheEntry::new("a".into(), None).unwrap(), true, &key).unwrap();
        prop_assert!(!store.contains_live(&key_b));

        let prefix = format!("{}{}", b.namespace_hash(), keys::KEY_SEPARATOR);
        prop_assert_eq!(store.remove_prefix(&prefix), 0);
        prop_assert!(store.contains_live(&key_a));
    }

    // Key hashes have the algorithm's fixed width and are deterministic.
    #[test]
    fn prop_hash_width(key in valid_key_strategy(), algorithm in algorithm_strategy()) {
        let hash = keys::hash_key(&key, algorithm).unwrap();
        let width = match algorithm {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        };
        prop_assert_eq!(hash.len(), width);
        prop_assert_eq!(hash, keys::hash_key(&key, algorithm).unwrap());
    }

    // With overwrite the second write wins; without it the first write stays.
    #[test]
    fn prop_overwrite_semantics(
        key in valid_key_strategy(),
        first in typed_value_strategy(),
        second in typed_value_strategy()
    ) {
        let mut store = MemoryStore::new();
        store.insert(key.clone(), CacheEntry::new(first.clone(), None).unwrap(), true, &key).unwrap();

        let refused = store.insert(key.clone(), CacheEntry::new(second.clone(), None).unwrap(), false, &key);
        prop_assert!(matches!(refused, Err(CacheError::DuplicateEntry(_))));
        prop_assert_eq!(&store.live_entry(&key).unwrap().value, &first);

        store.insert(key.clone(), CacheEntry::new(second.clone(), None).unwrap(), true, &key).unwrap();
        prop_assert_eq!(&store.live_entry(&key).unwrap().value, &second);
        prop_assert_eq!(store.len(), 1);
    }

    // Counter updates agree with plain integer arithmetic.
    #[test]
    fn prop_counter_arithmetic(start in any::<i64>(), delta in any::<i64>()) {
        let big = TypedValue::BigInt(BigInt::from(start));
        prop_assert_eq!(
            big.add_delta(delta),
            Some(TypedValue::BigInt(BigInt::from(start) + BigInt::from(delta)))
        );
        prop_assert_eq!(TypedValue::String(start.to_string()).add_delta(delta), None);
    }
}

// Separate proptest block with fewer cases for time-sensitive TTL tests
proptest! {
    #![proptest_config(ProptestConfig::with_cases(3))]

    // An expired entry is never visible and never blocks a non-overwriting insert.
    #[test]
    fn prop_expired_entries_are_absent(
        key in valid_key_strategy(),
        value in typed_value_strategy()
    ) {
        let mut store = MemoryStore::new();
        store.insert(key.clone(), CacheEntry::new(value.clone(), Some(1)).unwrap(), true, &key).unwrap();
        prop_assert!(store.contains_live(&key));

        sleep(Duration::from_millis(1100));

        prop_assert!(!store.contains_live(&key));
        prop_assert!(store.insert(key.clone(), CacheEntry::new(value, None).unwrap(), false, &key).is_ok());
    }
}

// Driver-level properties run on a throwaway runtime
proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    // Invalidating one namespace leaves every other namespace intact.
    #[test]
    fn prop_invalidate_is_namespace_scoped(
        key in valid_key_strategy(),
        value in typed_value_strategy()
    ) {
        tokio_test::block_on(async {
            let mut cache = MemoryDriver::new(DriverConfig::new().with_namespace("kept"));
            cache.set(&key, value.clone(), CacheOptions::new()).await.unwrap();

            cache.set_namespace(Some("dropped".to_string()));
            cache.set(&key, TypedValue::Null, CacheOptions::new()).await.unwrap();
            cache.invalidate().await.unwrap();
            prop_assert!(!cache.exists(&key).await.unwrap());

            cache.set_namespace(Some("kept".to_string()));
            prop_assert_eq!(cache.get(&key, CacheOptions::new()).await.unwrap(), Some(value));
            Ok(())
        })?;
    }
}
