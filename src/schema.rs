//! `$jsonSchema` generation from a typed field description, grounded on the distilled
//! driver's `SchemaGenerator`. Rather than reflecting over a host-language type (no
//! runtime reflection in Rust), callers describe their record's shape with [`FieldType`]
//! and hand it to [`SchemaGenerator::generate`].

use bson::{doc, Bson, Document};

use crate::error::{Result, SchemaGenerationError};

/// One field's type, as a tree mirroring the primitive/array/nested-document/enum/union
/// shapes §4.9 describes. Built up by hand or by a derive macro external to this core.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    String,
    Double,
    Int,
    Long,
    Bool,
    Null,
    ObjectId,
    Date,
    Timestamp,
    Binary,
    Array(Box<FieldType>),
    Document(Vec<Field>),
    /// A closed set of named values backed by a host-language enum type; each value's
    /// BSON kind is looked up independently so a mixed-kind enum (unusual, but legal)
    /// still produces a correct `bsonType` set.
    Enum(Vec<Bson>),
    /// A fixed set of literal values with no backing enum type (e.g. a `Literal["a","b"]`
    /// style annotation). Generates identically to `Enum` but is tracked separately so the
    /// union-merge rejection rules in §4.9 can distinguish the two, as the source does.
    Literal(Vec<Bson>),
    /// A union of the given member types. Validated and merged per §4.9's rejection rules
    /// when generated.
    Union(Vec<FieldType>),
}

impl FieldType {
    fn primitive_bson_type(&self) -> Option<&'static [&'static str]> {
        match self {
            FieldType::String => Some(&["string"]),
            FieldType::Double => Some(&["double"]),
            FieldType::Int => Some(&["int", "long"]),
            FieldType::Long => Some(&["long"]),
            FieldType::Bool => Some(&["bool"]),
            FieldType::Null => Some(&["null"]),
            FieldType::ObjectId => Some(&["objectId"]),
            FieldType::Date => Some(&["date"]),
            FieldType::Timestamp => Some(&["timestamp"]),
            FieldType::Binary => Some(&["binData"]),
            FieldType::Array(_) | FieldType::Document(_) | FieldType::Enum(_) | FieldType::Literal(_) | FieldType::Union(_) => None,
        }
    }
}

fn bson_value_kind(value: &Bson) -> &'static str {
    match value {
        Bson::String(_) => "string",
        Bson::Double(_) => "double",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binData",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        _ => "object",
    }
}

/// One field of a document-shaped schema: its type plus the `min`/`max`/`minLength`/
/// `maxLength` metadata constraints §4.9 carries over verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub optional: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_length(mut self, min_length: i64) -> Self {
        self.min_length = Some(min_length);
        self
    }

    pub fn max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Whether `_id` is added as a required `objectId` field of the generated top-level
/// schema (the server-default convention) or left out of `required`/`properties`
/// entirely, leaving it to the caller.
pub struct SchemaGenerator {
    pub additional_properties: bool,
}

impl SchemaGenerator {
    pub fn new(additional_properties: bool) -> Self {
        Self { additional_properties }
    }

    /// Generate a full `{$jsonSchema: {...}}` validator document from `fields`. `_id` is
    /// added as a required `objectId` field unless `additional_properties` is set. Only
    /// the top-level document gets this implicit `_id`; nested document fields generated
    /// via `FieldType::Document` do not.
    pub fn generate(&self, fields: &[Field]) -> Result<Document> {
        let payload = self.generate_object_payload(fields, true)?;
        Ok(doc! { "$jsonSchema": payload })
    }

    /// Generate the bare object payload (no `$jsonSchema` wrapper) for a document-shaped
    /// field. `top_level` gates the implicit `_id: objectId` property.
    fn generate_object_payload(&self, fields: &[Field], top_level: bool) -> Result<Document> {
        let add_id = top_level && !self.additional_properties;
        let mut required: Vec<String> = fields
            .iter()
            .filter(|f| !f.optional)
            .map(|f| f.name.clone())
            .collect();
        if add_id {
            required.push("_id".to_string());
        }

        let mut properties = Document::new();
        if add_id {
            properties.insert("_id", doc! { "bsonType": ["objectId"] });
        }
        for field in fields {
            properties.insert(&field.name, self.generate_field(field)?);
        }

        Ok(doc! {
            "bsonType": ["object"],
            "required": required,
            "properties": properties,
            "additionalProperties": self.additional_properties,
        })
    }

    fn generate_field(&self, field: &Field) -> Result<Document> {
        let mut payload = self.generate_type(&field.field_type, field.optional)?;
        if let Some(min) = field.min {
            payload.insert("minimum", min);
        }
        if let Some(max) = field.max {
            payload.insert("maximum", max);
        }
        if let Some(min_length) = field.min_length {
            payload.insert("minLength", min_length);
        }
        if let Some(max_length) = field.max_length {
            payload.insert("maxLength", max_length);
        }
        Ok(payload)
    }

    fn generate_type(&self, field_type: &FieldType, optional: bool) -> Result<Document> {
        if let Some(types) = field_type.primitive_bson_type() {
            let mut bson_type: Vec<Bson> = types.iter().map(|t| Bson::String(t.to_string())).collect();
            if optional {
                bson_type.push(Bson::String("null".to_string()));
            }
            return Ok(doc! { "bsonType": bson_type });
        }

        match field_type {
            FieldType::Array(item) => {
                let mut bson_type = vec![Bson::String("array".to_string())];
                if optional {
                    bson_type.push(Bson::String("null".to_string()));
                }
                Ok(doc! {
                    "bsonType": bson_type,
                    "items": self.generate_type(item, false)?,
                })
            }
            FieldType::Document(nested_fields) => self.generate_object_payload(nested_fields, false),
            FieldType::Enum(values) | FieldType::Literal(values) => {
                Ok(self.generate_enum_payload(values, optional))
            }
            FieldType::Union(members) => self.generate_union(members, optional),
            _ => unreachable!("primitive types are handled above"),
        }
    }

    fn generate_enum_payload(&self, values: &[Bson], optional: bool) -> Document {
        let mut enum_values = values.to_vec();
        let mut bson_types: Vec<&'static str> = values.iter().map(bson_value_kind).collect();
        if optional {
            enum_values.push(Bson::Null);
            bson_types.push("null");
        }
        bson_types.sort_unstable();
        bson_types.dedup();
        doc! {
            "enum": enum_values,
            "bsonType": bson_types.iter().map(|t| Bson::String(t.to_string())).collect::<Vec<_>>(),
        }
    }

    /// Merge `members` (plus an implicit trailing `"null"` if `optional`) per §4.9's
    /// rejection rules: a nested document, an enum, or a literal set may not be combined
    /// with any other non-null member.
    fn generate_union(&self, members: &[FieldType], optional: bool) -> Result<Document> {
        let non_null: Vec<&FieldType> = members.iter().filter(|m| **m != FieldType::Null).collect();

        let has_document = non_null.iter().any(|m| matches!(m, FieldType::Document(_)));
        if has_document && non_null.len() > 1 {
            return Err(SchemaGenerationError::MixedDocumentUnion.into());
        }
        let has_enum = non_null.iter().any(|m| matches!(m, FieldType::Enum(_)));
        if has_enum && non_null.len() > 1 {
            return Err(SchemaGenerationError::MixedEnumUnion.into());
        }
        let has_literal = non_null.iter().any(|m| matches!(m, FieldType::Literal(_)));
        if has_literal && non_null.len() > 1 {
            return Err(SchemaGenerationError::MixedLiteralUnion.into());
        }

        let union_is_optional = optional || members.iter().any(|m| *m == FieldType::Null);
        let mut bson_type: Vec<Bson> = Vec::new();
        let mut merged = Document::new();
        for member in &non_null {
            let payload = self.generate_type(member, false)?;
            if let Ok(types) = payload.get_array("bsonType") {
                for t in types {
                    if !bson_type.contains(t) {
                        bson_type.push(t.clone());
                    }
                }
            }
            for (k, v) in payload {
                if k != "bsonType" {
                    merged.insert(k, v);
                }
            }
        }
        if union_is_optional && !bson_type.contains(&Bson::String("null".to_string())) {
            bson_type.push(Bson::String("null".to_string()));
        }
        merged.insert("bsonType", bson_type);
        // Keep `bsonType` as the first key for readability when the document is printed.
        let mut ordered = doc! { "bsonType": merged.get("bsonType").cloned().unwrap() };
        for (k, v) in merged {
            if k != "bsonType" {
                ordered.insert(k, v);
            }
        }
        Ok(ordered)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generates_the_documented_name_age_example() {
        let generator = SchemaGenerator::new(false);
        let fields = vec![
            Field::new("name", FieldType::String),
            Field::new("age", FieldType::Int),
        ];
        let schema = generator.generate(&fields).unwrap();
        let inner = schema.get_document("$jsonSchema").unwrap();

        assert_eq!(
            inner.get_array("bsonType").unwrap(),
            &vec![Bson::String("object".to_string())]
        );
        let mut required: Vec<&str> = inner
            .get_array("required")
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        required.sort_unstable();
        assert_eq!(required, vec!["_id", "age", "name"]);
        assert!(!inner.get_bool("additionalProperties").unwrap());

        let properties = inner.get_document("properties").unwrap();
        assert_eq!(
            properties.get_document("name").unwrap().get_array("bsonType").unwrap(),
            &vec![Bson::String("string".to_string())]
        );
        assert_eq!(
            properties.get_document("age").unwrap().get_array("bsonType").unwrap(),
            &vec![Bson::String("int".to_string()), Bson::String("long".to_string())]
        );
        assert_eq!(
            properties.get_document("_id").unwrap().get_array("bsonType").unwrap(),
            &vec![Bson::String("objectId".to_string())]
        );
    }

    #[test]
    fn optional_field_adds_null_to_bson_type() {
        let generator = SchemaGenerator::new(false);
        let fields = vec![Field::new("nickname", FieldType::String).optional()];
        let schema = generator.generate(&fields).unwrap();
        let properties = schema
            .get_document("$jsonSchema")
            .unwrap()
            .get_document("properties")
            .unwrap();
        let bson_type = properties.get_document("nickname").unwrap().get_array("bsonType").unwrap();
        assert!(bson_type.contains(&Bson::String("null".to_string())));
        let required = schema
            .get_document("$jsonSchema")
            .unwrap()
            .get_array("required")
            .unwrap();
        assert!(!required.contains(&Bson::String("nickname".to_string())));
    }

    #[test]
    fn nested_document_type_recurses() {
        let generator = SchemaGenerator::new(false);
        let nested = vec![Field::new("street", FieldType::String)];
        let fields = vec![Field::new("address", FieldType::Document(nested))];
        let schema = generator.generate(&fields).unwrap();
        let properties = schema
            .get_document("$jsonSchema")
            .unwrap()
            .get_document("properties")
            .unwrap();
        let address = properties.get_document("address").unwrap();
        assert_eq!(
            address.get_array("bsonType").unwrap(),
            &vec![Bson::String("object".to_string())]
        );
        assert!(address.get_document("properties").unwrap().contains_key("street"));
        assert!(!address.get_document("properties").unwrap().contains_key("_id"));
    }

    #[test]
    fn mixing_a_document_with_another_type_in_a_union_is_rejected() {
        let generator = SchemaGenerator::new(false);
        let fields = vec![Field::new(
            "mixed",
            FieldType::Union(vec![FieldType::Document(vec![]), FieldType::String]),
        )];
        let err = generator.generate(&fields).unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::Schema(SchemaGenerationError::MixedDocumentUnion)
        ));
    }

    #[test]
    fn mixing_an_enum_with_another_type_in_a_union_is_rejected() {
        let generator = SchemaGenerator::new(false);
        let fields = vec![Field::new(
            "mixed",
            FieldType::Union(vec![FieldType::Enum(vec![Bson::String("a".to_string())]), FieldType::Int]),
        )];
        let err = generator.generate(&fields).unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::Schema(SchemaGenerationError::MixedEnumUnion)
        ));
    }

    #[test]
    fn a_document_union_with_only_null_is_allowed() {
        let generator = SchemaGenerator::new(false);
        let fields = vec![Field::new(
            "maybe_address",
            FieldType::Union(vec![FieldType::Document(vec![Field::new("street", FieldType::String)]), FieldType::Null]),
        )];
        let schema = generator.generate(&fields).unwrap();
        let properties = schema
            .get_document("$jsonSchema")
            .unwrap()
            .get_document("properties")
            .unwrap();
        let bson_type = properties.get_document("maybe_address").unwrap().get_array("bsonType").unwrap();
        assert!(bson_type.contains(&Bson::String("object".to_string())));
        assert!(bson_type.contains(&Bson::String("null".to_string())));
    }
}
