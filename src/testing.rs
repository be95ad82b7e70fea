//! Test data helpers.

use std::fs;
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::record::Record;

/// Generates records with short alphanumeric payloads, about a third of them repeating an earlier payload.
pub fn random_records(count: usize) -> Vec<Record> {
    let mut rng = rand::thread_rng();
    let mut records: Vec<Record> = Vec::with_capacity(count);

    for _ in 0..count {
        let key = rng.gen_range(0..1000);
        let payload = if !records.is_empty() && rng.gen_bool(0.3) {
            records[rng.gen_range(0..records.len())].payload.clone()
        } else {
            let len = rng.gen_range(1..=20);
            (&mut rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
        };
        records.push(Record::new(key, payload));
    }

    records
}

pub fn join_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> String {
    Vec::from_iter(records.into_iter().map(Record::to_string)).join("\r\n")
}

pub fn write_records(path: &Path, records: &[Record]) {
    fs::write(path, join_records(records)).unwrap();
}

/// Serialized content of the records in ascending order.
pub fn expected_sort(records: &[Record]) -> String {
    let mut sorted = records.to_vec();
    sorted.sort();
    join_records(&sorted)
}

/// Sorted names of the directory entries.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names = Vec::from_iter(
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned()),
    );
    names.sort();
    names
}
