#![allow(missing_docs)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use derivation::model::{ClassNode, Schema, VALUE_PROPERTY};
use derivation::query::{Condition, DataRequest, QueryBuilder, RangeSpec};
use derivation::store::{GraphStore, MemoryGraph};
use derivation::Value;

const AGES: [i64; 8] = [0, 17, 18, 40, 64, 65, 80, 99];

fn graph() -> (MemoryGraph, Schema) {
    let mut graph = MemoryGraph::new();
    for age in AGES {
        graph.add_node(&["Age"], [(VALUE_PROPERTY, Value::Int(age))]);
    }
    graph.add_node(&["Age"], [("unit", Value::from("years"))]);
    let schema = Schema::new().with_class(ClassNode::new("Age").with_short_label("AGE"));
    (graph, schema)
}

fn arb_range() -> impl Strategy<Value = RangeSpec> {
    (
        proptest::option::of(-5i64..105),
        proptest::option::of(-5i64..105),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(min, max, min_include, max_include, incl_null)| RangeSpec {
            min: min.map(Value::Int),
            max: max.map(Value::Int),
            min_include,
            max_include,
            incl_null,
        })
}

fn expected(range: &RangeSpec) -> (BTreeSet<i64>, bool) {
    let bound = |value: &Option<Value>| match value {
        Some(Value::Int(v)) => Some(*v),
        _ => None,
    };
    let (min, max) = (bound(&range.min), bound(&range.max));
    let ages = AGES
        .iter()
        .copied()
        .filter(|age| match min {
            Some(min) if range.min_include => *age >= min,
            Some(min) => *age > min,
            None => true,
        })
        .filter(|age| match max {
            Some(max) if range.max_include => *age <= max,
            Some(max) => *age < max,
            None => true,
        })
        .collect();
    (ages, range.incl_null)
}

proptest! {
    #[test]
    fn prop_range_rows_match_interval_semantics(range in arb_range()) {
        let (graph, schema) = graph();
        let request = DataRequest::new()
            .class("Age")
            .condition("Age", VALUE_PROPERTY, Condition::Range(range.clone()));
        let plan = QueryBuilder::new(&schema).build(&request).unwrap();
        let table = graph.fetch(&plan).unwrap();

        let mut ages = BTreeSet::new();
        let mut nulls = 0;
        for row in table.rows() {
            match row.get("AGE") {
                Some(Value::Int(age)) => {
                    ages.insert(*age);
                }
                Some(Value::Null) => nulls += 1,
                other => prop_assert!(false, "unexpected cell {:?}", other),
            }
        }
        let (want, with_null) = expected(&range);
        prop_assert_eq!(ages, want);
        prop_assert_eq!(nulls, usize::from(with_null));
    }

    #[test]
    fn prop_range_parameters_are_bound_in_order(range in arb_range()) {
        let (_, schema) = graph();
        let request = DataRequest::new()
            .class("Age")
            .condition("Age", VALUE_PROPERTY, Condition::Range(range.clone()));
        let plan = QueryBuilder::new(&schema).build(&request).unwrap();
        let bounds: Vec<Value> = [range.min.clone(), range.max.clone()].into_iter().flatten().collect();
        let params: Vec<Value> = plan.params.values().cloned().collect();
        prop_assert_eq!(params, bounds);
        prop_assert_eq!(plan.text.contains("IS NULL OR"), range.incl_null && (range.min.is_some() || range.max.is_some()));
    }

    #[test]
    fn prop_range_conditions_survive_json(range in arb_range()) {
        let condition = Condition::Range(range);
        let json = serde_json::to_value(&condition).unwrap();
        let back: Condition = serde_json::from_value(json).unwrap();
        prop_assert_eq!(back, condition);
    }
}
