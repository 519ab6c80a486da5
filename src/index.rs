//! Index descriptors for `createIndexes`/`listIndexes`/`dropIndexes`.

use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// One index to create, in the shape `createIndexes` expects. If no `name` is given,
/// `update_name` derives one from the key document the same way the server's own default
/// naming does (`field1_1_field2_-1`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
pub struct IndexModel {
    #[serde(rename = "key")]
    pub keys: Document,

    #[builder(default)]
    pub name: Option<String>,

    #[builder(default)]
    pub unique: Option<bool>,

    #[builder(default)]
    pub sparse: Option<bool>,

    #[serde(rename = "expireAfterSeconds")]
    #[builder(default)]
    pub expire_after_seconds: Option<i32>,
}

impl IndexModel {
    pub(crate) fn update_name(&mut self) {
        if self.name.is_none() {
            let key_names: Vec<String> = self
                .keys
                .iter()
                .map(|(k, v)| format!("{k}_{v}"))
                .collect();
            self.name = Some(key_names.join("_"));
        }
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut out = doc! { "key": self.keys.clone() };
        if let Some(name) = &self.name {
            out.insert("name", name);
        }
        if let Some(unique) = self.unique {
            out.insert("unique", unique);
        }
        if let Some(sparse) = self.sparse {
            out.insert("sparse", sparse);
        }
        if let Some(expire) = self.expire_after_seconds {
            out.insert("expireAfterSeconds", expire);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derives_a_default_name_from_keys() {
        let mut index = IndexModel::builder().keys(doc! { "a": 1, "b": -1 }).build();
        index.update_name();
        assert_eq!(index.name.as_deref(), Some("a_1_b_-1"));
    }

    #[test]
    fn an_explicit_name_is_left_untouched() {
        let mut index = IndexModel::builder()
            .keys(doc! { "a": 1 })
            .name(Some("custom".to_string()))
            .build();
        index.update_name();
        assert_eq!(index.name.as_deref(), Some("custom"));
    }
}
