//! Property tests: the byte budget and the cipher round trip.

use proptest::prelude::*;
use serde_json::json;

use layerkv_core::{
    BackingStore, ChunkCipher, EvictionCache, EvictionPolicy, MemoryStore, RsaKey,
};

const E: &str = "10001";
const N: &str = "90ec8c9a3dcca087a022d08737228633336affe4537f51629f4db017cd152e8168dea2ae0e4162abc3d49e0fb11dcef0e7c4126677b796516493dcd470dd4132831f1476b04f7f4c567cf2e6095c363073b4c3c1984ff5b34f68cf0a96c40ef90d367b557c50ba4707b23323749d4c8fe03f3fb61a7eb0925c05dd18c98d2fd3";
const D: &str = "8944b54ca73a79d6dcb3fd2605f01a82c6b2139cb605c31591e468e5b267dcbbd094082caaedfdc2c9e34aaf7c48caa95e2d566c5dfab35376dba2f049d3181b8ded5c41937be3f8d83f7ab98e5287dcec9555d84f46423befb723bad701a453106d2de75e68576bb23f1b536ccfa6087f7a111d6316bf7d143e8b8a0ceec291";

#[derive(Debug, Clone)]
enum Edit {
    Set(u8, usize),
    Delete(u8),
    Get(u8),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0u8..16, 0usize..200).prop_map(|(k, n)| Edit::Set(k, n)),
        1 => (0u8..16).prop_map(Edit::Delete),
        1 => (0u8..16).prop_map(Edit::Get),
    ]
}

proptest! {
    #[test]
    fn prop_lru_stays_within_budget(
        budget in 200usize..3_000,
        edits in prop::collection::vec(edit(), 1..120),
    ) {
        let mut cache =
            EvictionCache::new(MemoryStore::new(), budget, EvictionPolicy::Lru).unwrap();
        // pinned keys are small enough that they never fill the budget alone
        cache.pin("k0");
        cache.set("k0", json!(0)).unwrap();

        for edit in edits {
            match edit {
                Edit::Set(k, n) => cache.set(&format!("k{}", k), json!("x".repeat(n))).unwrap(),
                Edit::Delete(k) if k != 0 => cache.delete(&format!("k{}", k)).unwrap(),
                Edit::Delete(_) => {}
                Edit::Get(k) => {
                    cache.get(&format!("k{}", k)).unwrap();
                }
            }
            let pinned_only = cache.keys("*").unwrap().iter().all(|k| cache.is_pinned(k));
            prop_assert!(cache.current_bytes() <= budget || pinned_only);
            prop_assert!(cache.exists("k0").unwrap());
        }
    }

    #[test]
    fn prop_fifo_ledger_matches_store(
        edits in prop::collection::vec(edit(), 1..80),
    ) {
        let mut cache =
            EvictionCache::new(MemoryStore::new(), 1_500, EvictionPolicy::Fifo).unwrap();
        for edit in edits {
            match edit {
                Edit::Set(k, n) => {
                    let value = json!({"pad": "y".repeat(n)});
                    cache.set(&format!("k{}", k), value).unwrap()
                }
                Edit::Delete(k) => cache.delete(&format!("k{}", k)).unwrap(),
                Edit::Get(k) => {
                    cache.get(&format!("k{}", k)).unwrap();
                }
            }
            let live: usize = cache
                .keys("*")
                .unwrap()
                .iter()
                .map(|k| layerkv_core::size::entry_size(k, &cache.inner().get(k).unwrap().unwrap()))
                .sum();
            prop_assert_eq!(cache.current_bytes(), live);
        }
    }
}

proptest! {
    // each case runs full-size modular exponentiations
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_cipher_roundtrip(text in "\\PC{0,400}", compress in any::<bool>()) {
        let cipher = ChunkCipher::new(
            Some(RsaKey::from_hex(E, N).unwrap()),
            Some(RsaKey::from_hex(D, N).unwrap()),
        )
        .unwrap();
        let encrypted = cipher.encrypt_string(&text, compress).unwrap();
        prop_assert_eq!(cipher.decrypt_string(&encrypted).unwrap(), text);
    }
}
