//! Property tests for operation fingerprints

use proptest::prelude::*;
use usage_registry::usage::OperationKind;
use usage_registry::{OperationHash, OperationNormalizer};

fn field_names() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("f[a-z0-9]{0,6}", 1..6)
}

/// Insignificant characters between tokens, commas included
fn ignored() -> impl Strategy<Value = String> {
    "[ \t\n,]{0,3}"
}

fn document(name: &str, fields: &[String], gaps: &[String]) -> String {
    let gap = |i: usize| gaps[i % gaps.len()].as_str();
    let mut doc = format!("query {}{}{{{}", name, gap(0), gap(1));
    for (i, field) in fields.iter().enumerate() {
        // two adjacent names need at least one separator
        doc.push_str(field);
        doc.push(' ');
        doc.push_str(gap(i + 2));
    }
    doc.push('}');
    doc.push_str(gap(3));
    doc
}

fn coordinates(fields: &[String]) -> Vec<String> {
    let mut coordinates = vec!["Query".to_string()];
    coordinates.extend(fields.iter().map(|f| format!("Query.{}", f)));
    coordinates
}

proptest! {
    #[test]
    fn whitespace_does_not_change_the_hash(
        fields in field_names(),
        left in proptest::collection::vec(ignored(), 4),
        right in proptest::collection::vec(ignored(), 4),
    ) {
        let normalizer = OperationNormalizer::default();
        let coordinates = coordinates(&fields);

        let a = normalizer.normalize(&document("op", &fields, &left), Some("op"), &coordinates).unwrap();
        let b = normalizer.normalize(&document("op", &fields, &right), Some("op"), &coordinates).unwrap();

        prop_assert_eq!(&a.body, &b.body);
        prop_assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn coordinate_order_does_not_change_the_hash(
        fields in field_names(),
        seed in any::<u64>(),
    ) {
        let coordinates = coordinates(&fields);
        let mut shuffled = coordinates.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let body = "query op{f}";
        prop_assert_eq!(
            OperationHash::compute(body, OperationKind::Query, &coordinates, Some("op")),
            OperationHash::compute(body, OperationKind::Query, &shuffled, Some("op"))
        );
    }

    #[test]
    fn operation_name_changes_the_hash(
        a in "[A-Za-z][A-Za-z0-9]{0,8}",
        b in "[A-Za-z][A-Za-z0-9]{0,8}",
    ) {
        prop_assume!(a != b);
        let coordinates = ["Query", "Query.ping"];

        prop_assert_ne!(
            OperationHash::compute("{ping}", OperationKind::Query, &coordinates, Some(a.as_str())),
            OperationHash::compute("{ping}", OperationKind::Query, &coordinates, Some(b.as_str()))
        );
    }

    #[test]
    fn coordinate_set_changes_the_hash(
        fields in field_names(),
        extra in "g[a-z]{0,6}",
    ) {
        let coordinates = coordinates(&fields);
        let mut wider = coordinates.clone();
        wider.push(format!("Query.{}", extra));

        prop_assert_ne!(
            OperationHash::compute("{ping}", OperationKind::Query, &coordinates, None),
            OperationHash::compute("{ping}", OperationKind::Query, &wider, None)
        );
    }
}

#[test]
fn missing_name_differs_from_empty_name() {
    let coordinates = ["Query"];
    assert_ne!(
        OperationHash::compute("{ping}", OperationKind::Query, &coordinates, None),
        OperationHash::compute("{ping}", OperationKind::Query, &coordinates, Some(""))
    );
}
