use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, AsArray},
    datatypes::{
        DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
        SchemaRef, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
    },
    record_batch::RecordBatch,
    util::display::array_value_to_string,
};
use sluice_core::{error::SourceError, Row, RowSchema, Value};

pub fn row_schema(schema: &SchemaRef) -> RowSchema {
    RowSchema::new(schema.fields().iter().map(|f| f.name().clone()))
}

/// Split a record batch into rows sharing `schema`.
pub fn batch_to_rows(batch: &RecordBatch, schema: &Arc<RowSchema>) -> Result<Vec<Row>, SourceError> {
    let columns = batch.columns();
    let mut rows = Vec::with_capacity(batch.num_rows());
    for index in 0..batch.num_rows() {
        let values = columns
            .iter()
            .map(|column| cell(column, index))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(Row::new(schema.clone(), values));
    }
    Ok(rows)
}

fn cell(array: &ArrayRef, row: usize) -> Result<Value, SourceError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Boolean(array.as_boolean().value(row)),
        DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(row) as i64),
        DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(row) as i64),
        DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(row) as i64),
        DataType::UInt64 => {
            let v = array.as_primitive::<UInt64Type>().value(row);
            i64::try_from(v)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(v.to_string()))
        }
        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => Value::Text(array.as_string_view().value(row).to_string()),
        // Temporal, decimal and nested types use arrow's display formatting.
        _ => Value::Text(
            array_value_to_string(array.as_ref(), row)
                .map_err(|e| SourceError::Decode(e.to_string()))?,
        ),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::{BooleanArray, Date32Array, Float64Array, Int32Array, StringArray, UInt64Array},
        datatypes::{Field, Schema},
    };

    use super::*;

    #[test]
    fn converts_common_types() {
        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("n", DataType::Int32, true),
            Field::new("big", DataType::UInt64, false),
            Field::new("x", DataType::Float64, false),
            Field::new("ok", DataType::Boolean, false),
            Field::new("day", DataType::Date32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![Some("a"), None])),
                Arc::new(Int32Array::from(vec![None, Some(7)])),
                Arc::new(UInt64Array::from(vec![1, u64::MAX])),
                Arc::new(Float64Array::from(vec![0.5, 2.0])),
                Arc::new(BooleanArray::from(vec![true, false])),
                Arc::new(Date32Array::from(vec![0, 1])),
            ],
        )
        .unwrap();

        let row_schema = Arc::new(row_schema(&schema));
        let rows = batch_to_rows(&batch, &row_schema).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].values(),
            &[
                Value::Text("a".into()),
                Value::Null,
                Value::Int(1),
                Value::Float(0.5),
                Value::Boolean(true),
                Value::Text("1970-01-01".into()),
            ]
        );
        assert_eq!(rows[1].get("name"), Some(&Value::Null));
        assert_eq!(rows[1].get("big"), Some(&Value::Text(u64::MAX.to_string())));
        assert_eq!(rows[1].get("day"), Some(&Value::Text("1970-01-02".into())));
    }
}
