// Property tests for the open-addressed table and the intern set.
//
// The table must behave as a mathematical map over interned-string keys
// regardless of operation order, collisions, tombstones, and resizes;
// a std HashMap serves as the model.

use proptest::prelude::*;
use std::collections::HashMap;

use lox::heap::Heap;
use lox::object::ObjRef;
use lox::table::Table;
use lox::value::{values_equal, Value};

#[derive(Debug, Clone)]
enum Op {
    Set(u8, i32),
    Remove(u8),
    Get(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<i32>()).prop_map(|(k, v)| Op::Set(k % 24, v)),
        any::<u8>().prop_map(|k| Op::Remove(k % 24)),
        any::<u8>().prop_map(|k| Op::Get(k % 24)),
    ]
}

fn keys_for(heap: &mut Heap, count: u8) -> Vec<ObjRef> {
    (0..count).map(|i| heap.copy_string(&format!("key_{}", i))).collect()
}

proptest! {
    #[test]
    fn table_matches_a_map_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let mut heap = Heap::new();
        let keys = keys_for(&mut heap, 24);
        let mut table = Table::new();
        let mut model: HashMap<u8, i32> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    let key = keys[k as usize];
                    let hash = heap.str_hash(key);
                    let was_new = table.set(key, hash, Value::Number(v as f64));
                    let model_new = model.insert(k, v).is_none();
                    prop_assert_eq!(was_new, model_new);
                }
                Op::Remove(k) => {
                    let key = keys[k as usize];
                    let hash = heap.str_hash(key);
                    let removed = table.remove(key, hash);
                    let model_removed = model.remove(&k).is_some();
                    prop_assert_eq!(removed, model_removed);
                }
                Op::Get(k) => {
                    let key = keys[k as usize];
                    let hash = heap.str_hash(key);
                    let got = table.get(key, hash);
                    match model.get(&k) {
                        Some(v) => {
                            prop_assert!(got.is_some());
                            prop_assert!(values_equal(
                                got.unwrap_or(Value::Nil),
                                Value::Number(*v as f64)
                            ));
                        }
                        None => prop_assert!(got.is_none()),
                    }
                }
            }
        }

        prop_assert_eq!(table.live_count(), model.len());
        for (k, v) in &model {
            let key = keys[*k as usize];
            let hash = heap.str_hash(key);
            let got = table.get(key, hash).unwrap_or(Value::Nil);
            prop_assert!(values_equal(got, Value::Number(*v as f64)));
        }
    }

    #[test]
    fn interning_equality_matches_byte_equality(words in proptest::collection::vec("[a-z]{0,8}", 1..40)) {
        let mut heap = Heap::new();
        let handles: Vec<ObjRef> = words.iter().map(|w| heap.copy_string(w)).collect();

        for (i, a) in handles.iter().enumerate() {
            for (j, b) in handles.iter().enumerate() {
                let bytes_equal = words[i] == words[j];
                let handles_equal = a == b;
                let values_eq = values_equal(Value::Obj(*a), Value::Obj(*b));
                prop_assert_eq!(bytes_equal, handles_equal);
                prop_assert_eq!(bytes_equal, values_eq);
            }
        }
    }

    #[test]
    fn find_string_agrees_with_interning(words in proptest::collection::vec("[a-z]{1,6}", 1..20)) {
        let mut heap = Heap::new();
        for word in &words {
            let interned = heap.copy_string(word);
            let hash = heap.hash_str(word);
            prop_assert_eq!(heap.strings.find_string(&heap.arena, word, hash), Some(interned));
        }
        let hash = heap.hash_str("never interned");
        prop_assert!(heap.strings.find_string(&heap.arena, "never interned", hash).is_none());
    }
}
