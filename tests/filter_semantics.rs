#[path = "../src/test_support.rs"]
mod test_support;

mod support;

use proptest::prelude::*;
use tablerust_rs::backend::parse_filter;
use tablerust_rs::predicate::BinaryOp;
use tablerust_rs::{Entity, Field, MemoryBackend, Predicate, TableRecord, Value};
use test_support::{base_time, generate_events, memory_storage, memory_storage_with, Event};
use time::macros::datetime;
use time::Duration;

#[test]
fn filtered_query_matches_local_evaluation() -> anyhow::Result<()> {
    test_support::init_tracing();
    let (_backend, storage) = memory_storage();
    let events = generate_events(1000, 7);
    storage.add_entities(&events)?;

    let since = base_time() - Duration::days(500);
    let filter = support::political_or_recent_positive(since);
    let remote: Vec<Event> = storage.get_entities(Some(&filter))?;
    let local: Vec<&Event> = events
        .iter()
        .filter(|e| support::political_or_recent_positive_local(e, since))
        .collect();

    assert!(!local.is_empty());
    assert_eq!(remote.len(), local.len());
    assert_eq!(support::row_keys(&remote), support::row_keys(local));
    Ok(())
}

#[test]
fn get_all_entities_drains_every_page() -> anyhow::Result<()> {
    let (_backend, storage) = memory_storage_with(MemoryBackend::new().with_page_size(40));
    let events = generate_events(600, 8);
    storage.add_entities(&events)?;

    let since = base_time() - Duration::days(500);
    let filter = support::political_or_recent_positive(since);
    let expected = events
        .iter()
        .filter(|e| support::political_or_recent_positive_local(e, since))
        .count();
    assert!(expected > 40);

    let first_page: Vec<Event> = storage.get_entities(Some(&filter))?;
    assert_eq!(first_page.len(), 40);

    let all: Vec<Event> = storage.get_all_entities(Some(&filter))?;
    assert_eq!(all.len(), expected);

    let unfiltered: Vec<Event> = storage.get_all_entities(None)?;
    assert_eq!(unfiltered.len(), 600);
    Ok(())
}

#[test]
fn int64_literals_match_regardless_of_digit_count() -> anyhow::Result<()> {
    let (_backend, storage) = memory_storage();
    let storage = storage.with_table_name("Counters");
    let rows: Vec<Entity> = (1..=10_i64)
        .map(|i| Entity::new("c", format!("{i:02}")).with_field("Total", i))
        .chain(std::iter::once(
            Entity::new("c", "big").with_field("Total", 12_000_000_000_i64),
        ))
        .collect();
    storage.add_entities(&rows)?;

    let total = Field::int64("Total");
    let small: Vec<Entity> = storage.get_entities(Some(&total.ge(5)))?;
    assert_eq!(small.len(), 7);

    let nested = (total.gt(2) & total.lt(4)) | !(total.not_equals(12_000_000_000_i64));
    assert_eq!(
        nested.compile()?,
        "(((Total gt 2L) and (Total lt 4L)) or not (Total ne 12000000000L))"
    );
    let matched: Vec<Entity> = storage.get_entities(Some(&nested))?;
    let keys: Vec<&str> = matched.iter().map(|e| e.row_key.as_str()).collect();
    assert_eq!(keys, ["03", "big"]);
    Ok(())
}

#[test]
fn int32_declared_field_misses_int64_rows() -> anyhow::Result<()> {
    let (_backend, storage) = memory_storage();
    let storage = storage.with_table_name("Counters");
    storage.add_entity(&Entity::new("c", "a").with_field("Total", 5_i64))?;

    let as_int32: Vec<Entity> = storage.get_entities(Some(&Field::int32("Total").equals(5)))?;
    assert!(as_int32.is_empty());
    let as_int64: Vec<Entity> = storage.get_entities(Some(&Field::int64("Total").equals(5)))?;
    assert_eq!(as_int64.len(), 1);
    Ok(())
}

#[test]
fn datetime_equality_finds_rows_written_with_sub_tick_precision() -> anyhow::Result<()> {
    let (_backend, storage) = memory_storage();
    let storage = storage.with_table_name("Moments");
    let when = datetime!(2024-05-06 9:30:15.123456789 UTC);
    let row = Entity::new("m", "a").with_field("When", when);
    storage.add_entity(&row)?;

    let filter = Field::datetime("When").equals(when);
    assert!(filter.evaluate(&row)?);
    let hits: Vec<Entity> = storage.get_all_entities(Some(&filter))?;
    assert_eq!(hits.len(), 1);
    assert_eq!(
        hits[0].field("When"),
        Some(&Value::DateTime(datetime!(2024-05-06 9:30:15.1234567 UTC)))
    );

    // One tick later is a different instant.
    let later = Field::datetime("When").equals(when + Duration::nanoseconds(100));
    assert!(storage.get_all_entities::<Entity>(Some(&later))?.is_empty());
    assert!(!later.evaluate(&row)?);
    Ok(())
}

fn dataset() -> Vec<Entity> {
    generate_events(60, 99)
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let mut entity = event.to_entity();
            entity.set_field("Total", i as i64 * 100_000_000);
            // Sub-tick nanoseconds that the store drops.
            entity.set_field(
                "DateTime",
                event.date_time + Duration::nanoseconds((i as i64 * 37) % 300),
            );
            if i % 5 == 0 {
                entity.fields.remove("Description");
            }
            if i == 7 {
                entity.set_field("Description", "O'Neil");
            }
            entity
        })
        .collect()
}

fn comparison_op() -> impl Strategy<Value = BinaryOp> {
    prop_oneof![
        Just(BinaryOp::Eq),
        Just(BinaryOp::NotEq),
        Just(BinaryOp::Gt),
        Just(BinaryOp::GtEq),
        Just(BinaryOp::Lt),
        Just(BinaryOp::LtEq),
    ]
}

fn compare(field: Field, op: BinaryOp, value: impl Into<Value>) -> Predicate {
    Predicate::binary(Predicate::Field(field), op, Predicate::literal(value))
}

fn leaf() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        (comparison_op(), prop::sample::select(test_support::PARTITIONS.to_vec()))
            .prop_map(|(op, pk)| compare(Field::partition_key(), op, pk)),
        (comparison_op(), -1000..70_000_i32)
            .prop_map(|(op, n)| compare(Field::int32("NumberOfParticipants"), op, n)),
        (comparison_op(), -10.0..25_000.0_f64)
            .prop_map(|(op, c)| compare(Field::double("Cost"), op, c)),
        (comparison_op(), 0..70_i64, 0..300_i64)
            .prop_map(|(op, days, nanos)| compare(
                Field::datetime("DateTime"),
                op,
                base_time() - Duration::days(days) + Duration::nanoseconds(nanos)
            )),
        (comparison_op(), 0..7_000_000_000_i64)
            .prop_map(|(op, n)| compare(Field::int64("Total"), op, n)),
        // 32-bit literals widened by the declared field type.
        (comparison_op(), 0..21_i32)
            .prop_map(|(op, n)| compare(Field::int64("Total"), op, n * 100_000_000)),
        (comparison_op(), prop::sample::select(vec!["O'Neil", "Social4", "Nature2", "Political9"]))
            .prop_map(|(op, d)| compare(Field::string("Description"), op, d)),
        Just(Field::boolean("Positive").is_true()),
        (comparison_op(), 0..60_i32).prop_map(|(op, n)| {
            // Literal on the left of the field.
            Predicate::binary(
                Predicate::literal(n * 1000),
                op,
                Predicate::Field(Field::int32("NumberOfParticipants")),
            )
        }),
    ]
}

fn predicate() -> impl Strategy<Value = Predicate> {
    leaf().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l & r),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l | r),
            inner.prop_map(|p| !p),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compiled_filter_selects_exactly_the_matching_rows(predicate in predicate()) {
        let rows = dataset();
        let compiled = predicate.compile().unwrap();
        let parsed = parse_filter(&compiled).unwrap();

        let mut expected = std::collections::BTreeSet::new();
        for entity in &rows {
            let local = predicate.evaluate(entity).unwrap();
            prop_assert_eq!(parsed.matches(entity), local, "filter {}", compiled);
            if local {
                expected.insert(entity.row_key.clone());
            }
        }

        let (_backend, storage) = memory_storage();
        storage.add_entities(&rows).unwrap();
        let remote: Vec<Entity> = storage.get_all_entities(Some(&predicate)).unwrap();
        let actual: std::collections::BTreeSet<String> =
            remote.into_iter().map(|e| e.row_key).collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn structurally_equal_predicates_compile_identically(predicate in predicate()) {
        let copy = predicate.clone();
        prop_assert_eq!(predicate.compile().unwrap(), copy.compile().unwrap());
    }
}
