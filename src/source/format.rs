//! File Formats
//!
//! Every supported format is parsed into a `serde_json::Value` document, which
//! is flattened into colon-delimited keys for the merge and edited in place
//! when a writable file source persists a batch.

use super::{ChangeBatch, Entry};
use anyhow::{bail, Context};
use serde_json::{Map, Value};
use std::path::Path;

/// Hierarchy separator used by every key in the engine
pub const KEY_DELIMITER: &str = ":";

/// Hierarchy separator used by environment-style keys
pub const ENV_DELIMITER: &str = "__";

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Yaml,
    Toml,
    Ini,
    DotEnv,
}

impl FileFormat {
    /// Detect the format from a file extension or name
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if file_name == ".env" || file_name.starts_with(".env.") {
            return Some(Self::DotEnv);
        }
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            "ini" | "cfg" => Some(Self::Ini),
            "env" => Some(Self::DotEnv),
            _ => None,
        }
    }

    /// Type tag reported in source metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json => "json-file",
            Self::Yaml => "yaml-file",
            Self::Toml => "toml-file",
            Self::Ini => "ini-file",
            Self::DotEnv => "env-file",
        }
    }

    /// Parse text into a document
    pub fn parse(&self, content: &str) -> anyhow::Result<Value> {
        if content.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        let document = match self {
            Self::Json => serde_json::from_str(content).context("invalid JSON")?,
            Self::Yaml => {
                let yaml: serde_yaml::Value =
                    serde_yaml::from_str(content).context("invalid YAML")?;
                yaml_to_json(yaml)?
            }
            Self::Toml => toml::from_str(content).context("invalid TOML")?,
            Self::Ini => parse_ini(content)?,
            Self::DotEnv => parse_dotenv(content)?,
        };
        match document {
            Value::Object(_) => Ok(document),
            Value::Null => Ok(Value::Object(Map::new())),
            other => bail!("document root must be a table, found {}", type_name(&other)),
        }
    }

    /// Render a document back into text
    pub fn render(&self, document: &Value) -> anyhow::Result<String> {
        match self {
            Self::Json => {
                let mut text = serde_json::to_string_pretty(document)?;
                text.push('\n');
                Ok(text)
            }
            Self::Yaml => Ok(serde_yaml::to_string(document)?),
            Self::Toml => Ok(toml::to_string_pretty(&strip_nulls(document.clone()))?),
            Self::Ini => Ok(render_ini(document)),
            Self::DotEnv => Ok(render_dotenv(document)),
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Flatten a document into colon-delimited entries.
pub fn flatten(document: &Value) -> Vec<Entry> {
    let mut entries = Vec::new();
    flatten_into(document, &mut String::new(), &mut entries);
    entries
}

fn flatten_into(value: &Value, prefix: &mut String, out: &mut Vec<Entry>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                with_segment(prefix, key, |path| flatten_into(child, path, out));
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                with_segment(prefix, &index.to_string(), |path| flatten_into(child, path, out));
            }
        }
        Value::Null => out.push((prefix.clone(), None)),
        Value::String(s) => out.push((prefix.clone(), Some(s.clone()))),
        Value::Bool(b) => out.push((prefix.clone(), Some(b.to_string()))),
        Value::Number(n) => out.push((prefix.clone(), Some(n.to_string()))),
    }
}

fn with_segment(prefix: &mut String, segment: &str, f: impl FnOnce(&mut String)) {
    let len = prefix.len();
    if !prefix.is_empty() {
        prefix.push_str(KEY_DELIMITER);
    }
    prefix.push_str(segment);
    f(prefix);
    prefix.truncate(len);
}

/// Apply a batch to a parsed document. `None` removes the key and prunes
/// tables left empty by the removal.
pub fn apply_changes(document: &mut Value, changes: &ChangeBatch) -> anyhow::Result<()> {
    for (key, value) in changes {
        let segments: Vec<&str> = key.split(KEY_DELIMITER).collect();
        if segments.iter().any(|s| s.is_empty()) {
            bail!("invalid key '{}'", key);
        }
        match value {
            Some(value) => set_path(document, &segments, value)
                .with_context(|| format!("cannot set '{}'", key))?,
            None => {
                remove_path(document, &segments);
            }
        }
    }
    Ok(())
}

fn set_path(node: &mut Value, segments: &[&str], value: &str) -> anyhow::Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::String(value.to_string());
        return Ok(());
    };
    if !node.is_object() && !node.is_array() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Array(items) => {
            let index: usize = head
                .parse()
                .with_context(|| format!("'{}' is not an index into an array", head))?;
            if index == items.len() {
                items.push(Value::Null);
            }
            let child = items
                .get_mut(index)
                .with_context(|| format!("index {} is out of bounds", index))?;
            set_path(child, rest, value)
        }
        Value::Object(map) => {
            let existing = find_key(map, head).unwrap_or_else(|| head.to_string());
            let child = map.entry(existing).or_insert(Value::Null);
            set_path(child, rest, value)
        }
        _ => bail!("cannot descend into a scalar value"),
    }
}

fn remove_path(node: &mut Value, segments: &[&str]) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return false;
    };
    match node {
        Value::Object(map) => {
            let Some(existing) = find_key(map, head) else {
                return false;
            };
            if rest.is_empty() {
                return map.shift_remove(&existing).is_some();
            }
            let removed = map
                .get_mut(&existing)
                .map(|child| remove_path(child, rest))
                .unwrap_or(false);
            if removed && map.get(&existing).is_some_and(is_empty_container) {
                map.shift_remove(&existing);
            }
            removed
        }
        Value::Array(items) => {
            let Ok(index) = head.parse::<usize>() else {
                return false;
            };
            if index >= items.len() {
                return false;
            }
            if rest.is_empty() {
                items.remove(index);
                return true;
            }
            let removed = remove_path(&mut items[index], rest);
            if removed && is_empty_container(&items[index]) {
                items.remove(index);
            }
            removed
        }
        _ => false,
    }
}

fn find_key(map: &Map<String, Value>, segment: &str) -> Option<String> {
    map.keys().find(|k| k.eq_ignore_ascii_case(segment)).cloned()
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a table",
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> anyhow::Result<Value> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                // NaN and infinities have no JSON number form
                serde_json::Number::from_f64(n.as_f64().unwrap_or(f64::NAN))
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(n.to_string()))
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<anyhow::Result<_>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, value) in mapping {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    other => bail!("unsupported YAML mapping key: {:?}", other),
                };
                map.insert(key, yaml_to_json(value)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value)?,
    })
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(strip_nulls)
                .collect(),
        ),
        other => other,
    }
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    if !quoted {
        return raw.to_string();
    }
    let inner = &raw[1..raw.len() - 1];
    if raw.starts_with('"') {
        inner
            .replace("\\n", "\n")
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        inner.to_string()
    }
}

fn quote_if_needed(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.trim() != value
        || value.contains(['#', ';', '"', '\'', '\n', '='].as_slice());
    if needs_quotes {
        format!(
            "\"{}\"",
            value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
        )
    } else {
        value.to_string()
    }
}

fn parse_dotenv(content: &str) -> anyhow::Result<Value> {
    let mut document = Value::Object(Map::new());
    let mut changes = ChangeBatch::new();
    for item in dotenvy::from_read_iter(content.as_bytes()) {
        let (key, value) = item.map_err(|e| anyhow::anyhow!("invalid .env content: {}", e))?;
        changes.insert(key.replace(ENV_DELIMITER, KEY_DELIMITER), Some(value));
    }
    apply_changes(&mut document, &changes)?;
    Ok(document)
}

fn render_dotenv(document: &Value) -> String {
    let mut text = String::new();
    for (key, value) in flatten(document) {
        let value = value.unwrap_or_default();
        text.push_str(&key.replace(KEY_DELIMITER, ENV_DELIMITER));
        text.push('=');
        // Single quotes stop the loader from expanding `$NAME`
        if value.contains('$') && !value.contains(['\'', '\n'].as_slice()) {
            text.push_str(&format!("'{}'", value));
        } else {
            text.push_str(&quote_if_needed(&value));
        }
        text.push('\n');
    }
    text
}

fn parse_ini(content: &str) -> anyhow::Result<Value> {
    let mut document = Value::Object(Map::new());
    let mut changes = ChangeBatch::new();
    let mut section = String::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[') {
            let Some(name) = header.strip_suffix(']') else {
                bail!("line {}: unterminated section header", number + 1);
            };
            section = name.trim().to_string();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!("line {}: expected key=value", number + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("line {}: empty key", number + 1);
        }
        let full_key = if section.is_empty() {
            key.to_string()
        } else {
            format!("{}{}{}", section, KEY_DELIMITER, key)
        };
        changes.insert(full_key, Some(unquote(value)));
    }
    apply_changes(&mut document, &changes)?;
    Ok(document)
}

fn render_ini(document: &Value) -> String {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for (key, value) in flatten(document) {
        let (section, leaf) = match key.rsplit_once(KEY_DELIMITER) {
            Some((section, leaf)) => (section.to_string(), leaf.to_string()),
            None => (String::new(), key),
        };
        let value = value.unwrap_or_default();
        match sections.iter_mut().find(|(name, _)| *name == section) {
            Some((_, entries)) => entries.push((leaf, value)),
            None => sections.push((section, vec![(leaf, value)])),
        }
    }
    // Keys without a section must come before the first header
    sections.sort_by_key(|(name, _)| !name.is_empty());

    let mut text = String::new();
    for (name, entries) in sections {
        if !name.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[{}]\n", name));
        }
        for (key, value) in entries {
            text.push_str(&format!("{}={}\n", key, quote_if_needed(&value)));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn lookup(entries: &[Entry], key: &str) -> Option<Option<String>> {
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_path(&PathBuf::from("app.json")), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_path(&PathBuf::from("app.YML")), Some(FileFormat::Yaml));
        assert_eq!(FileFormat::from_path(&PathBuf::from("/etc/app.toml")), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_path(&PathBuf::from("legacy.ini")), Some(FileFormat::Ini));
        assert_eq!(FileFormat::from_path(&PathBuf::from(".env")), Some(FileFormat::DotEnv));
        assert_eq!(FileFormat::from_path(&PathBuf::from(".env.local")), Some(FileFormat::DotEnv));
        assert_eq!(FileFormat::from_path(&PathBuf::from("notes.txt")), None);
    }

    #[test]
    fn test_json_flatten_nested_and_arrays() {
        let doc = FileFormat::Json
            .parse(r#"{"Database": {"Host": "localhost", "Port": 5432, "Replicas": ["a", "b"]}, "Debug": true, "Empty": null}"#)
            .unwrap();
        let entries = flatten(&doc);

        assert_eq!(lookup(&entries, "Database:Host"), Some(Some("localhost".into())));
        assert_eq!(lookup(&entries, "Database:Port"), Some(Some("5432".into())));
        assert_eq!(lookup(&entries, "Database:Replicas:1"), Some(Some("b".into())));
        assert_eq!(lookup(&entries, "Debug"), Some(Some("true".into())));
        assert_eq!(lookup(&entries, "Empty"), Some(None));
    }

    #[test]
    fn test_yaml_and_toml_flatten() {
        let yaml = FileFormat::Yaml.parse("app:\n  name: demo\n  workers: 4\n").unwrap();
        let entries = flatten(&yaml);
        assert_eq!(lookup(&entries, "app:name"), Some(Some("demo".into())));
        assert_eq!(lookup(&entries, "app:workers"), Some(Some("4".into())));

        let toml = FileFormat::Toml.parse("[server]\nport = 8080\n[server.tls]\nenabled = false\n").unwrap();
        let entries = flatten(&toml);
        assert_eq!(lookup(&entries, "server:port"), Some(Some("8080".into())));
        assert_eq!(lookup(&entries, "server:tls:enabled"), Some(Some("false".into())));
    }

    #[test]
    fn test_dotenv_parsing() {
        let doc = FileFormat::DotEnv
            .parse("# comment\nexport APP__NAME=demo\nDB__PASSWORD=\"p#ss word\"\nQUOTED='single'\n")
            .unwrap();
        let entries = flatten(&doc);
        assert_eq!(lookup(&entries, "APP:NAME"), Some(Some("demo".into())));
        assert_eq!(lookup(&entries, "DB:PASSWORD"), Some(Some("p#ss word".into())));
        assert_eq!(lookup(&entries, "QUOTED"), Some(Some("single".into())));

        let rendered = FileFormat::DotEnv.render(&doc).unwrap();
        assert!(rendered.contains("APP__NAME=demo\n"));
        assert!(rendered.contains("DB__PASSWORD=\"p#ss word\"\n"));
    }

    #[test]
    fn test_dotenv_keeps_dollar_values_literal() {
        let mut doc = Value::Object(Map::new());
        let mut changes = ChangeBatch::new();
        changes.insert("Db:Password".into(), Some("pa$word".into()));
        apply_changes(&mut doc, &changes).unwrap();

        let rendered = FileFormat::DotEnv.render(&doc).unwrap();
        assert_eq!(rendered, "Db__Password='pa$word'\n");
        let parsed = FileFormat::DotEnv.parse(&rendered).unwrap();
        assert_eq!(lookup(&flatten(&parsed), "Db:Password"), Some(Some("pa$word".into())));

        assert!(FileFormat::DotEnv.parse("NOT VALID LINE\n").is_err());
    }

    #[test]
    fn test_ini_parsing_and_rendering() {
        let doc = FileFormat::Ini
            .parse("root=1\n; comment\n[Database]\nHost = db.local\n[Database:Pool]\nSize=10\n")
            .unwrap();
        let entries = flatten(&doc);
        assert_eq!(lookup(&entries, "root"), Some(Some("1".into())));
        assert_eq!(lookup(&entries, "Database:Host"), Some(Some("db.local".into())));
        assert_eq!(lookup(&entries, "Database:Pool:Size"), Some(Some("10".into())));

        let rendered = FileFormat::Ini.render(&doc).unwrap();
        assert!(rendered.starts_with("root=1\n"));
        assert!(rendered.contains("[Database]\nHost=db.local\n"));
        assert!(rendered.contains("[Database:Pool]\nSize=10\n"));
    }

    #[test]
    fn test_apply_changes_preserves_untouched_types() {
        let mut doc = FileFormat::Json.parse(r#"{"Server": {"Port": 8080, "Host": "a"}}"#).unwrap();
        let mut changes = ChangeBatch::new();
        changes.insert("server:host".into(), Some("b".into()));
        changes.insert("App:Name".into(), Some("demo".into()));
        apply_changes(&mut doc, &changes).unwrap();

        assert_eq!(doc["Server"]["Port"], Value::from(8080));
        assert_eq!(doc["Server"]["Host"], Value::from("b"));
        assert_eq!(doc["App"]["Name"], Value::from("demo"));
        assert!(doc["Server"].get("host").is_none());
    }

    #[test]
    fn test_remove_prunes_empty_parents() {
        let mut doc = FileFormat::Json.parse(r#"{"A": {"B": {"C": "x"}}, "Keep": "y"}"#).unwrap();
        let mut changes = ChangeBatch::new();
        changes.insert("A:B:C".into(), None);
        apply_changes(&mut doc, &changes).unwrap();

        assert!(doc.get("A").is_none());
        assert_eq!(doc["Keep"], Value::from("y"));
    }

    #[test]
    fn test_rejects_non_table_root() {
        assert!(FileFormat::Json.parse("[1, 2]").is_err());
        assert!(FileFormat::Json.parse("").unwrap().is_object());
    }
}
