//! YAML parsing for request specs.
//!
//! Files are read into [`RawValue`] first, a value type whose mappings
//! keep duplicate keys, so duplicates can be reported as warnings instead
//! of hard failures. The cleaned value is then converted into the typed
//! model per sequence, so type mismatches name the sequence they occur in.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_yaml::Value;

use super::{process, ParseError, Sequence, Specs};

/// A YAML value whose mappings preserve entry order and duplicates.
pub(crate) enum RawValue {
    Null,
    Bool(bool),
    Number(serde_yaml::Number),
    String(String),
    Sequence(Vec<RawValue>),
    Mapping(Vec<(String, RawValue)>),
}

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = RawValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a yaml value")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(RawValue::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(RawValue::Null)
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(RawValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(RawValue::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(RawValue::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(RawValue::Number(v.into()))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(RawValue::String(v.to_string()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(RawValue::Sequence(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, RawValue>()? {
                    entries.push(entry);
                }
                Ok(RawValue::Mapping(entries))
            }
        }

        deserializer.deserialize_any(RawVisitor)
    }
}

impl RawValue {
    /// Converts into a plain value, warning on duplicate mapping keys.
    /// The last value of a duplicated key wins.
    fn into_value(self, path: &str, log: &mut dyn FnMut(String)) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(b),
            RawValue::Number(n) => Value::Number(n),
            RawValue::String(s) => Value::String(s),
            RawValue::Sequence(items) => Value::Sequence(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| item.into_value(&format!("{path}[{i}]"), log))
                    .collect(),
            ),
            RawValue::Mapping(entries) => {
                let mut map = serde_yaml::Mapping::new();
                for (key, value) in entries {
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    let value = value.into_value(&child, log);
                    if map.insert(Value::String(key), value).is_some() {
                        log(format!("warning: duplicate field {child}; using the last value"));
                    }
                }
                Value::Mapping(map)
            }
        }
    }
}

const TOP_FIELDS: &[&str] = &["sequences"];
const SEQUENCE_FIELDS: &[&str] = &["request", "args", "nodes", "retry", "retryWait"];
const ARGS_FIELDS: &[&str] = &["required", "optional", "static"];
const ARG_FIELDS: &[&str] = &["name", "default"];
const NODE_FIELDS: &[&str] = &[
    "category", "type", "each", "args", "sets", "deps", "retry", "retryWait", "if", "eq",
    "parallel",
];
const NODE_ARG_FIELDS: &[&str] = &["expected", "given"];
const NODE_SET_FIELDS: &[&str] = &["arg", "as"];

fn warn_unknown_keys(value: &Value, path: &str, known: &[&str], log: &mut dyn FnMut(String)) {
    if let Value::Mapping(map) = value {
        for key in map.keys() {
            if let Value::String(key) = key {
                if !known.contains(&key.as_str()) {
                    log(format!("warning: unknown field {path}.{key}"));
                }
            }
        }
    }
}

fn warn_unknown_arg_list(value: &Value, path: &str, log: &mut dyn FnMut(String)) {
    if let Value::Sequence(args) = value {
        for (i, arg) in args.iter().enumerate() {
            warn_unknown_keys(arg, &format!("{path}[{i}]"), ARG_FIELDS, log);
        }
    }
}

/// Warns on fields the model does not know about. Unknown fields are
/// ignored by the typed conversion, so this is the only place they are
/// ever surfaced.
fn warn_unknown_fields(top: &Value, log: &mut dyn FnMut(String)) {
    warn_unknown_keys(top, "", TOP_FIELDS, log);
    let Some(sequences) = top.get("sequences").and_then(Value::as_mapping) else {
        return;
    };
    for (seq_name, seq) in sequences {
        let Some(seq_name) = seq_name.as_str() else {
            continue;
        };
        let seq_path = format!("sequences.{seq_name}");
        warn_unknown_keys(seq, &seq_path, SEQUENCE_FIELDS, log);
        if let Some(args) = seq.get("args") {
            warn_unknown_keys(args, &format!("{seq_path}.args"), ARGS_FIELDS, log);
            for bucket in ARGS_FIELDS {
                if let Some(list) = args.get(bucket) {
                    warn_unknown_arg_list(list, &format!("{seq_path}.args.{bucket}"), log);
                }
            }
        }
        let Some(nodes) = seq.get("nodes").and_then(Value::as_mapping) else {
            continue;
        };
        for (node_name, node) in nodes {
            let Some(node_name) = node_name.as_str() else {
                continue;
            };
            let node_path = format!("{seq_path}.nodes.{node_name}");
            warn_unknown_keys(node, &node_path, NODE_FIELDS, log);
            if let Some(Value::Sequence(args)) = node.get("args") {
                for (i, arg) in args.iter().enumerate() {
                    warn_unknown_keys(arg, &format!("{node_path}.args[{i}]"), NODE_ARG_FIELDS, log);
                }
            }
            if let Some(Value::Sequence(sets)) = node.get("sets") {
                for (i, set) in sets.iter().enumerate() {
                    warn_unknown_keys(set, &format!("{node_path}.sets[{i}]"), NODE_SET_FIELDS, log);
                }
            }
        }
    }
}

fn parse_with_origin(
    yaml: &str,
    origin: &str,
    log: &mut dyn FnMut(String),
) -> Result<Specs, ParseError> {
    let raw: RawValue = serde_yaml::from_str(yaml).map_err(|source| ParseError::Syntax {
        path: origin.to_string(),
        source,
    })?;
    let value = raw.into_value("", log);
    warn_unknown_fields(&value, log);

    let mut sequences = BTreeMap::new();
    match value.get("sequences") {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(map)) => {
            for (seq_name, seq_value) in map {
                let Some(seq_name) = seq_name.as_str() else {
                    continue;
                };
                let seq: Sequence = serde_yaml::from_value(seq_value.clone()).map_err(|source| {
                    ParseError::Type {
                        path: format!("sequences.{seq_name}"),
                        source,
                    }
                })?;
                sequences.insert(seq_name.to_string(), seq);
            }
        }
        Some(other) => {
            // Surface the usual serde error for a wrong-typed `sequences`
            if let Err(source) =
                serde_yaml::from_value::<BTreeMap<String, Sequence>>(other.clone())
            {
                return Err(ParseError::Type {
                    path: "sequences".to_string(),
                    source,
                });
            }
        }
    }

    let mut specs = Specs { sequences };
    process(&mut specs);
    Ok(specs)
}

/// Parses a spec document from a string. Duplicate mapping keys and
/// unknown fields are reported through `log`; syntax and type errors fail.
pub fn parse_str(yaml: &str, log: &mut dyn FnMut(String)) -> Result<Specs, ParseError> {
    parse_with_origin(yaml, "spec", log)
}

/// Parses a single spec file.
pub fn parse(path: impl AsRef<Path>, log: &mut dyn FnMut(String)) -> Result<Specs, ParseError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let yaml = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: origin.clone(),
        source,
    })?;
    parse_with_origin(&yaml, &origin, log)
}

/// Parses every `.yaml` file in a directory into one combined spec set.
/// A sequence name defined in more than one file is a fatal error.
pub fn parse_dir(dir: impl AsRef<Path>, log: &mut dyn FnMut(String)) -> Result<Specs, ParseError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|source| ParseError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();

    let mut specs = Specs::default();
    let mut defined_in: BTreeMap<String, String> = BTreeMap::new();
    for file in files {
        let file_specs = parse(&file, log)?;
        for (name, seq) in file_specs.sequences {
            let origin = file.display().to_string();
            if let Some(first) = defined_in.get(&name) {
                return Err(ParseError::DuplicateSequence {
                    name,
                    first: first.clone(),
                    second: origin,
                });
            }
            defined_in.insert(name.clone(), origin);
            specs.sequences.insert(name, seq);
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::spec::NodeCategory;

    const DECOMM: &str = r#"
sequences:
  decommission-cluster:
    request: true
    args:
      required:
        - name: cluster
        - name: env
      static:
        - name: sleepTime
          default: "1000"
    nodes:
      get-instances:
        category: job
        type: cluster/get-instances
        args:
          - expected: cluster
            given: cluster
        sets:
          - arg: instances
      pre-flight-checks:
        category: sequence
        type: check-instance-is-ok
        each:
          - instances:instance
        deps: [get-instances]
      decommission-instances:
        category: job
        type: cluster/decomm-instances
        args:
          - expected: cluster
          - expected: instances
        deps: [pre-flight-checks]
        retry: 2
        retryWait: 500ms
  check-instance-is-ok:
    args:
      required:
        - name: instance
    nodes:
      check-ok:
        category: job
        type: cluster/check-ok
        args:
          - expected: instance
        sets:
          - arg: physicalhost
            as: host
"#;

    #[test]
    fn test_parse_str() {
        let mut warnings = Vec::new();
        let specs = parse_str(DECOMM, &mut |w| warnings.push(w)).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(specs.sequences.len(), 2);

        let decomm = &specs.sequences["decommission-cluster"];
        assert!(decomm.request);
        assert_eq!(decomm.name, "decommission-cluster");
        assert_eq!(decomm.args.required.len(), 2);
        assert_eq!(decomm.args.static_args[0].default.as_deref(), Some("1000"));

        let checks = &decomm.nodes["pre-flight-checks"];
        assert_eq!(checks.category, NodeCategory::Sequence);
        assert_eq!(checks.each, vec!["instances:instance".to_string()]);
        assert_eq!(checks.deps, vec!["get-instances".to_string()]);

        // Defaults pass ran: given/as filled in, retry wait kept
        let get = &decomm.nodes["get-instances"];
        assert_eq!(get.sets[0].set_as.as_deref(), Some("instances"));
        let decomm_instances = &decomm.nodes["decommission-instances"];
        assert_eq!(decomm_instances.args[1].given.as_deref(), Some("instances"));
        assert_eq!(decomm_instances.retry_wait, "500ms");
    }

    #[test]
    fn test_parse_round_trip() {
        let specs = parse_str(DECOMM, &mut |_| {}).unwrap();
        let yaml = serde_yaml::to_string(&specs).unwrap();
        // Names are re-derived from map keys on the way back in
        let reparsed = parse_str(&yaml, &mut |_| {}).unwrap();
        assert_eq!(reparsed, specs);
    }

    #[test]
    fn test_warn_duplicate_field() {
        let yaml = r#"
sequences:
  seq-a:
    request: true
    request: false
    nodes:
      node-a:
        type: job-type-a
"#;
        let mut warnings = Vec::new();
        let specs = parse_str(yaml, &mut |w| warnings.push(w)).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("warning"), "got: {}", warnings[0]);
        assert!(warnings[0].contains("sequences.seq-a.request"));
        // last value wins
        assert!(!specs.sequences["seq-a"].request);
    }

    #[test]
    fn test_warn_unknown_field() {
        let yaml = r#"
sequences:
  seq-a:
    nodes:
      node-a:
        type: job-type-a
        retries: 3
"#;
        let mut warnings = Vec::new();
        parse_str(yaml, &mut |w| warnings.push(w)).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("sequences.seq-a.nodes.node-a.retries"));
    }

    #[test]
    fn test_fail_type_mismatch() {
        let yaml = r#"
sequences:
  seq-a:
    nodes:
      node-a:
        type: job-type-a
        retry: lots
"#;
        let err = parse_str(yaml, &mut |_| {}).unwrap_err();
        match err {
            ParseError::Type { path, .. } => assert_eq!(path, "sequences.seq-a"),
            other => panic!("expected type error, got {other}"),
        }
    }

    #[test]
    fn test_parse_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut f1 = std::fs::File::create(dir.path().join("a.yaml")).unwrap();
        writeln!(f1, "sequences:\n  seq-a:\n    nodes:\n      n:\n        type: t").unwrap();
        let mut f2 = std::fs::File::create(dir.path().join("b.yaml")).unwrap();
        writeln!(f2, "sequences:\n  seq-b:\n    nodes:\n      n:\n        type: t").unwrap();

        let specs = parse_dir(dir.path(), &mut |_| {}).unwrap();
        assert_eq!(
            specs.sequences.keys().collect::<Vec<_>>(),
            vec!["seq-a", "seq-b"]
        );
    }

    #[test]
    fn test_fail_parse_dir_duplicate_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut f1 = std::fs::File::create(dir.path().join("a.yaml")).unwrap();
        writeln!(f1, "sequences:\n  seq-a:\n    nodes:\n      n:\n        type: t").unwrap();
        let mut f2 = std::fs::File::create(dir.path().join("b.yaml")).unwrap();
        writeln!(f2, "sequences:\n  seq-a:\n    nodes:\n      n:\n        type: t").unwrap();

        let err = parse_dir(dir.path(), &mut |_| {}).unwrap_err();
        match err {
            ParseError::DuplicateSequence { name, .. } => assert_eq!(name, "seq-a"),
            other => panic!("expected duplicate sequence error, got {other}"),
        }
    }
}
