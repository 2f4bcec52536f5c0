//! Data frames returned by query execution
//!
//! The JSON form follows the DataFrameJSON layout:
//! `{ "schema": { "name", "refId", "fields": [...] }, "data": { "values": [[...], ...] } }`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::labels::Labels;

/// Type of the values in a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Timestamps in epoch milliseconds
    Time,
    /// Floating point numbers; `null` means NaN
    Number,
    /// Strings
    String,
    /// Booleans
    Boolean,
}

/// One column of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Value type
    pub field_type: FieldType,
    /// Series labels
    pub labels: Labels,
    /// Column values
    pub values: Vec<serde_json::Value>,
}

impl Field {
    /// A numeric field
    pub fn number(name: impl Into<String>, labels: Labels, values: &[f64]) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Number,
            labels,
            values: values
                .iter()
                .map(|v| serde_json::Number::from_f64(*v).map_or(serde_json::Value::Null, Into::into))
                .collect(),
        }
    }

    /// A time field holding epoch milliseconds
    pub fn time(name: impl Into<String>, millis: &[i64]) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Time,
            labels: Labels::new(),
            values: millis.iter().map(|m| (*m).into()).collect(),
        }
    }

    /// Numeric view of the values; non-numbers read as NaN
    pub fn as_f64(&self) -> Vec<f64> {
        self.values
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN))
            .collect()
    }
}

/// A table of equally long fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    /// Frame name
    pub name: String,
    /// Query that produced the frame
    pub ref_id: String,
    /// Columns
    pub fields: Vec<Field>,
}

impl DataFrame {
    /// Create a frame
    pub fn new(ref_id: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: String::new(),
            ref_id: ref_id.into(),
            fields,
        }
    }

    /// Field names and types, used to detect structural changes
    pub fn shape(&self) -> Vec<(String, FieldType)> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type))
            .collect()
    }

    /// Whether the frame carries no rows
    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|f| f.values.is_empty())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameJson {
    schema: SchemaJson,
    #[serde(default)]
    data: DataJson,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaJson {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default)]
    ref_id: String,
    #[serde(default)]
    fields: Vec<FieldSchemaJson>,
}

#[derive(Serialize, Deserialize)]
struct FieldSchemaJson {
    name: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    labels: Labels,
}

#[derive(Default, Serialize, Deserialize)]
struct DataJson {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl Serialize for DataFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FrameJson {
            schema: SchemaJson {
                name: self.name.clone(),
                ref_id: self.ref_id.clone(),
                fields: self
                    .fields
                    .iter()
                    .map(|f| FieldSchemaJson {
                        name: f.name.clone(),
                        field_type: f.field_type,
                        labels: f.labels.clone(),
                    })
                    .collect(),
            },
            data: DataJson {
                values: self.fields.iter().map(|f| f.values.clone()).collect(),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = FrameJson::deserialize(deserializer)?;
        let mut values = json.data.values.into_iter();

        let fields = json
            .schema
            .fields
            .into_iter()
            .map(|schema| Field {
                name: schema.name,
                field_type: schema.field_type,
                labels: schema.labels,
                values: values.next().unwrap_or_default(),
            })
            .collect();

        Ok(DataFrame {
            name: json.schema.name,
            ref_id: json.schema.ref_id,
            fields,
        })
    }
}
