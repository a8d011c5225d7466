//! Locating and loading the bot's TOML configuration.
//!
//! The file is `<config-dir>/<environment>.toml` unless `--config` names one
//! explicitly. After loading, environment variables of the form
//! `HERALD__SECTION__KEY=value` override individual keys, e.g.
//! `HERALD__SERVER__PORT=6697` or `HERALD__USER__PASSWORD=secret`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Prefix for per-key environment overrides.
pub const ENV_PREFIX: &str = "HERALD__";

/// The config file for `environment`, unless an explicit path was given.
pub fn resolve_path(explicit: Option<&Path>, config_dir: &Path, environment: &str) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => config_dir.join(format!("{environment}.toml")),
    }
}

/// Read the file and apply environment overrides from `vars`.
pub fn load(path: &Path, vars: impl IntoIterator<Item = (String, String)>) -> Result<toml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("can't read config file {}", path.display()))?;
    let mut value: toml::Value =
        toml::from_str(&text).with_context(|| format!("bad config file {}", path.display()))?;
    apply_env_overrides(&mut value, vars)?;
    Ok(value)
}

/// Overlay `PREFIX`ed variables onto `root`. Values that parse as a TOML
/// literal (numbers, booleans, arrays) keep that type; anything else is a
/// string.
pub fn apply_env_overrides(
    root: &mut toml::Value,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<()> {
    for (name, raw) in vars {
        let Some(path) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let keys: Vec<String> = path.split("__").map(str::to_ascii_lowercase).collect();
        if keys.iter().any(String::is_empty) {
            bail!("malformed override variable {name}");
        }
        set_path(root, &keys, parse_scalar(&raw)).with_context(|| format!("can't apply {name}"))?;
        tracing::debug!(key = %keys.join("."), "Configuration overridden from environment");
    }
    Ok(())
}

fn parse_scalar(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn set_path(root: &mut toml::Value, keys: &[String], value: toml::Value) -> Result<()> {
    let Some((last, parents)) = keys.split_last() else {
        bail!("empty key");
    };
    let mut node = root;
    for key in parents {
        let table = node
            .as_table_mut()
            .with_context(|| format!("{key} is not inside a table"))?;
        node = table
            .entry(key.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
    let table = node
        .as_table_mut()
        .with_context(|| format!("{last} is not inside a table"))?;
    table.insert(last.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let dir = Path::new("config");
        assert_eq!(resolve_path(None, dir, "dev"), PathBuf::from("config/dev.toml"));
        assert_eq!(
            resolve_path(Some(Path::new("/etc/herald.toml")), dir, "dev"),
            PathBuf::from("/etc/herald.toml")
        );
    }

    #[test]
    fn overrides_keep_literal_types() {
        let mut root: toml::Value = toml::from_str("[server]\naddress = \"a\"\nport = 6667\n").unwrap();
        apply_env_overrides(
            &mut root,
            vars(&[
                ("HERALD__SERVER__PORT", "6697"),
                ("HERALD__SERVER__SECURE", "true"),
                ("HERALD__USER__PASSWORD", "not a literal"),
                ("HERALD__CHANNELS", r##"["#a", "#b"]"##),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(root["server"]["address"].as_str(), Some("a"));
        assert_eq!(root["server"]["port"].as_integer(), Some(6697));
        assert_eq!(root["server"]["secure"].as_bool(), Some(true));
        assert_eq!(root["user"]["password"].as_str(), Some("not a literal"));
        assert_eq!(root["channels"].as_array().map(Vec::len), Some(2));
        assert!(root.get("path").is_none());
    }

    #[test]
    fn malformed_override_names_are_rejected() {
        let mut root = toml::Value::Table(toml::Table::new());
        assert!(apply_env_overrides(&mut root, vars(&[("HERALD__SERVER____PORT", "1")])).is_err());
    }

    #[test]
    fn override_through_a_scalar_is_rejected() {
        let mut root: toml::Value = toml::from_str("debug = true\n").unwrap();
        assert!(apply_env_overrides(&mut root, vars(&[("HERALD__DEBUG__LEVEL", "1")])).is_err());
    }
}
