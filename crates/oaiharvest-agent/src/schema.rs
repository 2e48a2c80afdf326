//! Arrow schema for stored harvest records

use std::sync::{Arc, LazyLock};

use arrow::datatypes::{DataType, Field, Schema};
use oaiharvest_harvester::CHECKSUM_LEN;

pub static RECORDS: LazyLock<Arc<Schema>> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("base_url", DataType::Utf8, false),
        Field::new("identifier", DataType::Utf8, false),
        Field::new("datestamp", DataType::Utf8, false),
        Field::new("deleted", DataType::Boolean, false),
        Field::new("sets", list_utf8(), false),
        // null for records without a metadata payload
        Field::new(
            "checksum",
            DataType::FixedSizeBinary(CHECKSUM_LEN as i32),
            true,
        ),
        Field::new("xml_gz", DataType::Binary, false),
    ]))
});

fn list_utf8() -> DataType {
    DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
}

pub fn records() -> Arc<Schema> {
    RECORDS.clone()
}
