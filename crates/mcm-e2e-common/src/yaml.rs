//! YAML manifest parsing using yaml-rust2
//!
//! Manifests are converted to `serde_json::Value` so they can be handed to
//! kube-rs `DynamicObject` APIs without a second schema.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse every document of a (possibly multi-document) YAML string.
///
/// Empty documents, e.g. a trailing `---`, are dropped.
pub fn parse_documents(input: &str) -> Result<Vec<Value>> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::Yaml(e.to_string()))?;
    docs.into_iter()
        .map(yaml_to_json)
        .filter(|doc| !matches!(doc, Ok(Value::Null)))
        .collect()
}

fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::Yaml(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(items) => items
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| Ok((yaml_key(k)?, yaml_to_json(v)?)))
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::Yaml("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(Error::Yaml("bad YAML value".to_string())),
    }
}

fn yaml_key(key: Yaml) -> Result<String> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(Error::Yaml("unsupported YAML key type".to_string())),
    }
}
