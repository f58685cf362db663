//! CSV encoding of item sequences.
//!
//! Pages and deltas share one format: a header row followed by one row per
//! item, UTF-8, comma-delimited, columns
//! `title,author,link,home,source,date,timestamp,tags`.

use std::io::Read;
use std::path::Path;

use super::item::{validate, Item, RawItem};

/// Items decoded from one file, plus how many rows were refused.
#[derive(Debug, Default)]
pub struct Decoded {
    pub items: Vec<Item>,
    pub skipped: usize,
}

/// Serializes items to CSV bytes.
///
/// Output is fully determined by the input, which is what makes re-merging an
/// unchanged facet byte-identical.
pub fn encode_items(items: &[Item]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for item in items {
        writer.serialize(item)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Decodes and validates every row of a CSV document.
///
/// Unreadable rows and rows failing validation are skipped and logged with
/// `origin` as context. Only a failure to read the header is returned as an
/// error, leaving it to the caller to treat the whole file as empty.
pub fn decode_items<R: Read>(reader: R, origin: &Path) -> Result<Decoded, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let mut decoded = Decoded::default();

    for (row, record) in reader.records().enumerate() {
        let raw: RawItem = match record.and_then(|r| r.deserialize(Some(&headers))) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(file = %origin.display(), row = row + 1, error = %e, "Skipping unreadable row");
                decoded.skipped += 1;
                continue;
            }
        };

        match validate(raw) {
            Ok(item) => decoded.items.push(item),
            Err(reason) => {
                tracing::warn!(file = %origin.display(), row = row + 1, reason = %reason, "Skipping invalid item");
                decoded.skipped += 1;
            }
        }
    }

    Ok(decoded)
}
