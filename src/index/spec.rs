use anyhow::{bail, Error};
use mongodb::bson::{Bson, Document};

use crate::error::RebuildError;

/// Reserved suffix for covering indexes. User indexes must never carry it.
pub const TEMP_SUFFIX: &str = "_cover_temp";

/// The `_id` index cannot be dropped and is never rebuilt.
pub const ID_INDEX_NAME: &str = "_id_";

/// Index options assigned by the server or meaningless after 4.2, stripped
/// during normalization.
const STRIPPED_OPTIONS: &[&str] = &["v", "ns", "background", "key", "name"];

/// A single index as seen by the orchestrator: ordered key document plus a
/// normalized option document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Document,
    pub options: Document,
}

impl IndexSpec {
    /// Build a spec from raw server output, normalizing the options.
    pub fn new<N: Into<String>>(name: N, keys: Document, options: Document) -> Self {
        Self {
            name: name.into(),
            keys,
            options: normalize_options(&options),
        }
    }

    pub fn is_id(&self) -> bool {
        self.name == ID_INDEX_NAME
    }

    pub fn is_temp(&self) -> bool {
        self.name.ends_with(TEMP_SUFFIX)
    }

    pub fn is_unique(&self) -> bool {
        self.options.get_bool("unique").unwrap_or(false)
    }

    pub fn temp_name(&self) -> String {
        format!("{}{}", self.name, TEMP_SUFFIX)
    }

    /// Inverse of [`IndexSpec::temp_name`]. Returns the original name for a
    /// covering index name, `None` for anything else.
    pub fn original_name_of_temp(temp_name: &str) -> Option<&str> {
        temp_name.strip_suffix(TEMP_SUFFIX).filter(|base| !base.is_empty())
    }

    /// Derive the covering index from this one.
    ///
    /// Options are copied verbatim, except that any server-assigned version
    /// is already stripped by normalization. TTL options survive so the
    /// covering index expires documents exactly like the original. Unique
    /// indexes are refused: a parallel unique build races concurrent writers.
    pub fn derive_temp(&self, allow_unique: bool) -> Result<IndexSpec, RebuildError> {
        if self.is_id() {
            return Err(RebuildError::fatal("refusing to rebuild the _id index"));
        }
        if self.is_temp() {
            return Err(RebuildError::fatal(format!(
                "index '{}' carries the reserved suffix '{}'",
                self.name, TEMP_SUFFIX
            )));
        }
        if self.is_unique() && !allow_unique {
            return Err(RebuildError::fatal(format!(
                "index '{}' is unique - rebuilding it under live writes can \
                 admit duplicates (pass --allow-unique to override)",
                self.name
            )));
        }

        Ok(IndexSpec {
            name: self.temp_name(),
            keys: self.keys.clone(),
            options: self.options.clone(),
        })
    }

    /// Two specs are equivalent iff their key sequences are element-wise
    /// equal in order and their normalized options are equal.
    pub fn equivalent(&self, other: &IndexSpec) -> bool {
        keys_equivalent(&self.keys, &other.keys) && self.options == other.options
    }

    /// Render the `createIndexes` element for this spec.
    pub fn to_create_doc(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("key", self.keys.clone());
        doc.insert("name", self.name.clone());
        for (k, v) in self.options.iter() {
            doc.insert(k.clone(), v.clone());
        }
        doc
    }

    /// Parse one element of a `listIndexes` batch.
    pub fn from_server_doc(doc: &Document) -> Result<IndexSpec, Error> {
        let name = match doc.get_str("name") {
            Ok(name) => name.to_string(),
            Err(_) => bail!("index document without a name: {:?}", doc),
        };
        let keys = match doc.get_document("key") {
            Ok(keys) => keys.clone(),
            Err(_) => bail!("index '{}' has no key document", name),
        };
        let mut options = Document::new();
        for (k, v) in doc.iter() {
            if k == "key" || k == "name" {
                continue;
            }
            options.insert(k.clone(), v.clone());
        }
        Ok(IndexSpec::new(name, keys, options))
    }
}

/// Canonicalize an option document: stable key order, server bookkeeping and
/// default-valued booleans removed, nested documents (notably
/// `partialFilterExpression`) recursively key-sorted.
pub fn normalize_options(options: &Document) -> Document {
    let mut keys: Vec<&String> = options
        .iter()
        .map(|(k, _)| k)
        .filter(|k| !STRIPPED_OPTIONS.contains(&k.as_str()))
        .collect();
    keys.sort();

    let mut out = Document::new();
    for key in keys {
        let value = &options[key.as_str()];
        // missing and explicit-default collapse to missing
        if let Bson::Boolean(false) = value {
            if matches!(key.as_str(), "unique" | "sparse" | "hidden") {
                continue;
            }
        }
        out.insert(key.clone(), canonicalize(value));
    }
    out
}

/// Recursively sort document keys so structurally equal expressions compare
/// equal regardless of insertion order.
fn canonicalize(value: &Bson) -> Bson {
    match value {
        Bson::Document(doc) => {
            let mut keys: Vec<&String> = doc.iter().map(|(k, _)| k).collect();
            keys.sort();
            let mut out = Document::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&doc[key.as_str()]));
            }
            Bson::Document(out)
        }
        Bson::Array(items) => Bson::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Key sequences must match element-wise *in order*. Directions are compared
/// numerically (`Int32(1)`, `Int64(1)` and `Double(1.0)` unify; `1` and `-1`
/// stay distinct); type strings (`"text"`, `"2dsphere"`, …) compare exactly.
pub fn keys_equivalent(a: &Document, b: &Document) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
        if ka != kb {
            return false;
        }
        match (numeric(va), numeric(vb)) {
            (Some(x), Some(y)) => x == y,
            (None, None) => va == vb,
            _ => false,
        }
    })
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}
