use std::cmp::Ordering;
use std::collections::BTreeMap;

use proptest::prelude::*;
use stagewise_types::{KeyValue, Value};

const TWO_POW_53: i64 = 1 << 53;

/// Integers and floats clustered around 2^53, where `f64` stops being exact,
/// plus arbitrary finite numbers.
#[allow(clippy::cast_precision_loss)]
fn numeric() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-16_i64..16).prop_map(|d| Value::Int(TWO_POW_53 + d)),
        (-16_i64..16).prop_map(|d| Value::Float((TWO_POW_53 + d) as f64)),
        (-16_i64..16).prop_map(|d| Value::Float((TWO_POW_53 + d) as f64 + 0.5)),
        any::<i64>().prop_map(Value::Int),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(Value::Float),
    ]
}

/// Exact value as a rational `n / 2`, or `None` when out of that range.
#[allow(clippy::cast_possible_truncation)]
fn halves(value: &Value) -> Option<i128> {
    match value {
        Value::Int(i) => Some(i128::from(*i) * 2),
        Value::Float(f) if (f * 2.0).fract() == 0.0 && f.abs() < 1e30 => Some((f * 2.0) as i128),
        _ => None,
    }
}

proptest! {
    #[test]
    fn ordering_is_transitive(a in numeric(), b in numeric(), c in numeric()) {
        if a <= b && b <= c {
            prop_assert!(a <= c, "{a:?} <= {b:?} <= {c:?}");
        }
        if a == b && b == c {
            prop_assert_eq!(&a, &c);
        }
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn ordering_matches_exact_arithmetic(a in numeric(), b in numeric()) {
        if let (Some(x), Some(y)) = (halves(&a), halves(&b)) {
            prop_assert_eq!(a.cmp(&b), x.cmp(&y), "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn distinct_integer_keys_never_collapse(
        offsets in prop::collection::btree_set(-64_i64..64, 1..32),
        float_offset in -64_i64..64,
    ) {
        let mut keys: BTreeMap<KeyValue, usize> = BTreeMap::new();
        for (i, d) in offsets.iter().enumerate() {
            keys.insert(KeyValue::new(vec![Value::Int(TWO_POW_53 + d)]), i);
        }
        prop_assert_eq!(keys.len(), offsets.len());

        #[allow(clippy::cast_precision_loss)]
        let needle = Value::Float((TWO_POW_53 + float_offset) as f64);
        let matches = keys
            .keys()
            .filter(|k| k.values()[0].cmp(&needle) == Ordering::Equal)
            .count();
        prop_assert!(matches <= 1);
    }
}
