use std::collections::BTreeSet;

use tablerust_rs::{Field, Predicate};
use time::OffsetDateTime;

use crate::test_support::Event;

/// `(PartitionKey == "Political" && !(Cost <= 50000.55) && 200000 < NumberOfParticipants)
///  || (Positive && DateTime >= since)`
#[allow(dead_code)]
pub fn political_or_recent_positive(since: OffsetDateTime) -> Predicate {
    let political = Field::partition_key().equals("Political");
    let expensive = !Field::double("Cost").le(50000.55);
    let crowded = Predicate::binary(
        Predicate::literal(200_000),
        tablerust_rs::predicate::BinaryOp::Lt,
        Predicate::Field(Field::int32("NumberOfParticipants")),
    );
    let recent_positive =
        Field::boolean("Positive").equals(true) & Field::datetime("DateTime").ge(since);
    (political & expensive & crowded) | recent_positive
}

/// The same condition evaluated directly on the typed records.
#[allow(dead_code)]
pub fn political_or_recent_positive_local(event: &Event, since: OffsetDateTime) -> bool {
    (event.partition_key == "Political"
        && !(event.cost <= 50000.55)
        && 200_000 < event.number_of_participants)
        || (event.positive && event.date_time >= since)
}

#[allow(dead_code)]
pub fn row_keys<'a>(events: impl IntoIterator<Item = &'a Event>) -> BTreeSet<String> {
    events.into_iter().map(|e| e.row_key.clone()).collect()
}
