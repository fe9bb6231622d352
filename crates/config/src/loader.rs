use std::{fmt::Write, path::Path, str::FromStr};

use anyhow::bail;
use indoc::indoc;
use serde::Deserialize;
use serde_dynamic_string::DynamicString;
use toml::Value;

use crate::Config;

/// One step of a path into the raw TOML document.
enum Segment {
    Key(String),
    Index(usize),
}

/// Result of expanding one value.
enum Expanded {
    Kept,
    /// The value referenced a missing environment variable and is optional.
    /// `levels` counts how many enclosing containers are dropped along with it.
    Dropped { levels: usize },
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;

    let config = parse(&content)?;
    validate(&config)?;

    for warning in collect_warnings(&config) {
        log::warn!("{warning}");
    }

    Ok(config)
}

pub(crate) fn parse(content: &str) -> anyhow::Result<Config> {
    let mut raw_config: Value = toml::from_str(content)?;

    if let Expanded::Dropped { .. } = expand_dynamic_strings(&mut Vec::new(), &mut raw_config)? {
        bail!("The configuration root cannot be dropped");
    }

    Ok(Config::deserialize(raw_config)?)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    validate_has_accounts(config)?;

    let backoff = config.backoff();

    if backoff.multiplier < 1.0 {
        bail!(
            "dispatch.backoff.multiplier must be at least 1.0, got {}",
            backoff.multiplier
        );
    }

    if backoff.initial_interval > backoff.max_interval {
        bail!("dispatch.backoff.initial_interval must not exceed dispatch.backoff.max_interval");
    }

    Ok(())
}

pub(crate) fn validate_has_accounts(config: &Config) -> anyhow::Result<()> {
    if config.providers.chat_account_count() == 0 {
        bail!(indoc! {r#"
            No provider accounts configured. The dispatcher requires at least one Groq or OpenRouter API key.

            Example configuration:

              [providers.groq]
              api_keys = ["{{ env.GROQ_API_KEY }}"]

              [providers.openrouter]
              api_keys = ["{{ env.OPENROUTER_API_KEY }}", "{{ env.OPENROUTER_API_KEY_2 }}"]
        "#});
    }

    Ok(())
}

/// Settings that load fine but are probably not what the operator wants.
pub(crate) fn collect_warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    for (key, policy) in &config.rate_limit.buckets {
        if policy.capacity() <= 0 || policy.refill_rate() <= 0.0 {
            warnings.push(format!(
                "Bucket '{key}' has no capacity or refill rate and will allow every request"
            ));
        }
    }

    if config.dispatch.worker_replicas == 0 {
        warnings.push("dispatch.worker_replicas is 0, pacing as a single worker".to_string());
    }

    if config.dispatch.max_candidates == 0 {
        warnings.push("dispatch.max_candidates is 0, every chat call will fail".to_string());
    }

    if matches!(config.rate_limit.storage, crate::StorageConfig::Memory) && config.dispatch.worker_replicas > 1 {
        warnings.push(
            "Rate limit storage is in memory while several worker replicas are configured, limits are per process"
                .to_string(),
        );
    }

    warnings
}

/// How many enclosing containers to drop when the value at `path` references
/// a missing environment variable, or `None` if the value is required.
fn optional_env_field(path: &str) -> Option<usize> {
    const OPTIONAL_FIELDS: &[&str] = &[
        "providers.groq.base_url",
        "providers.openrouter.base_url",
        "providers.openrouter.referer",
        "providers.openrouter.title",
        "providers.openai.base_url",
        "providers.openai.api_key",
    ];

    const OPTIONAL_ELEMENTS: &[&str] = &["providers.groq.api_keys[", "providers.openrouter.api_keys["];

    if OPTIONAL_FIELDS.contains(&path) {
        return Some(0);
    }

    if OPTIONAL_ELEMENTS.iter().any(|prefix| path.starts_with(prefix)) && path.ends_with(']') {
        return Some(0);
    }

    // Without a URL the mirror section means nothing.
    if path == "rate_limit.mirror.url" {
        return Some(1);
    }

    None
}

/// Check if the error is specifically about a missing environment variable
fn is_missing_env_var_error<E: std::fmt::Display>(err: &E) -> bool {
    let err_str = err.to_string().to_lowercase();

    err_str.contains("environment variable not found")
        || err_str.contains("env var")
        || (err_str.contains("variable") && err_str.contains("not found"))
}

fn render_path(path: &[Segment]) -> String {
    let mut p = String::new();

    for segment in path {
        match segment {
            Segment::Key(key) => {
                if !p.is_empty() {
                    p.push('.');
                }
                p.push_str(key);
            }
            Segment::Index(i) => {
                let _ = write!(p, "[{i}]");
            }
        }
    }

    p
}

fn expand_dynamic_strings(path: &mut Vec<Segment>, value: &mut Value) -> anyhow::Result<Expanded> {
    match value {
        Value::String(s) => match DynamicString::<String>::from_str(s) {
            Ok(out) => *s = out.into_inner(),
            Err(err) => {
                let p = render_path(path);

                if is_missing_env_var_error(&err)
                    && let Some(levels) = optional_env_field(&p)
                {
                    log::debug!("Dropping optional field '{p}' due to missing environment variable");
                    return Ok(Expanded::Dropped { levels });
                }

                bail!("Failed to expand dynamic string at path '{p}': {err}");
            }
        },
        Value::Array(values) => {
            let mut dropped = Vec::new();

            for (i, value) in values.iter_mut().enumerate() {
                path.push(Segment::Index(i));
                let expanded = expand_dynamic_strings(path, value)?;
                path.pop();

                match expanded {
                    Expanded::Kept => (),
                    Expanded::Dropped { levels: 0 } => dropped.push(i),
                    Expanded::Dropped { levels } => return Ok(Expanded::Dropped { levels: levels - 1 }),
                }
            }

            for i in dropped.into_iter().rev() {
                values.remove(i);
            }
        }
        Value::Table(map) => {
            let mut dropped = Vec::new();

            for (key, value) in map.iter_mut() {
                path.push(Segment::Key(key.clone()));
                let expanded = expand_dynamic_strings(path, value)?;
                path.pop();

                match expanded {
                    Expanded::Kept => (),
                    Expanded::Dropped { levels: 0 } => dropped.push(key.clone()),
                    Expanded::Dropped { levels } => return Ok(Expanded::Dropped { levels: levels - 1 }),
                }
            }

            for key in dropped {
                map.remove(&key);
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(Expanded::Kept)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use indoc::indoc;
    use insta::assert_snapshot;
    use secrecy::ExposeSecret;

    use super::*;

    fn load_str(content: &str) -> anyhow::Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        load(file.path())
    }

    #[test]
    fn config_without_accounts_is_rejected() {
        let error = load_str(indoc! {r#"
            [providers.groq]
            api_keys = []
        "#})
        .unwrap_err();

        assert_snapshot!(error, @r#"
        No provider accounts configured. The dispatcher requires at least one Groq or OpenRouter API key.

        Example configuration:

          [providers.groq]
          api_keys = ["{{ env.GROQ_API_KEY }}"]

          [providers.openrouter]
          api_keys = ["{{ env.OPENROUTER_API_KEY }}", "{{ env.OPENROUTER_API_KEY_2 }}"]
        "#);
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        let error = load_str(indoc! {r#"
            [providers.groq]
            api_keys = ["gsk-1"]

            [dispatch.backoff]
            multiplier = 0.5
        "#})
        .unwrap_err();

        assert_snapshot!(error, @"dispatch.backoff.multiplier must be at least 1.0, got 0.5");
    }

    #[test]
    fn present_environment_variable_is_expanded() {
        let config = load_str(indoc! {r#"
            [providers.openrouter]
            api_keys = ["sk-or-1"]
            referer = "{{ env.PATH }}"
        "#})
        .unwrap();

        let referer = config.providers.openrouter.unwrap().referer.unwrap();
        assert_eq!(referer, std::env::var("PATH").unwrap());
    }

    #[test]
    fn missing_optional_account_key_is_dropped() {
        let config = load_str(indoc! {r#"
            [providers.openrouter]
            api_keys = ["sk-or-1", "{{ env.DISPATCHER_TEST_SURELY_UNSET_KEY }}"]
            base_url = "{{ env.DISPATCHER_TEST_SURELY_UNSET_URL }}"
        "#})
        .unwrap();

        let openrouter = config.providers.openrouter.unwrap();
        let keys: Vec<_> = openrouter.api_keys.iter().map(|k| k.expose_secret().to_string()).collect();

        assert_eq!(keys, vec!["sk-or-1"]);
        assert_eq!(openrouter.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn missing_mirror_url_drops_the_mirror() {
        let config = load_str(indoc! {r#"
            [providers.groq]
            api_keys = ["gsk-1"]

            [rate_limit.mirror]
            url = "{{ env.DISPATCHER_TEST_SURELY_UNSET_DATABASE_URL }}"
            max_connections = 2
        "#})
        .unwrap();

        assert!(config.rate_limit.mirror.is_none());
    }

    #[test]
    fn missing_required_variable_is_an_error() {
        let error = load_str(indoc! {r#"
            [providers.groq]
            api_keys = ["gsk-1"]

            [rate_limit.storage]
            type = "redis"
            url = "{{ env.DISPATCHER_TEST_SURELY_UNSET_REDIS_URL }}"
        "#})
        .unwrap_err();

        assert!(
            error
                .to_string()
                .starts_with("Failed to expand dynamic string at path 'rate_limit.storage.url'")
        );
    }

    #[test]
    fn zero_capacity_bucket_produces_a_warning() {
        let config = parse(indoc! {r#"
            [providers.groq]
            api_keys = ["gsk-1"]

            [rate_limit.buckets."groq:default"]
            requests_per_minute = 0

            [rate_limit.buckets."openrouter:default"]
            requests_per_minute = 20
        "#})
        .unwrap();

        let warnings = collect_warnings(&config);

        assert_eq!(
            warnings,
            vec!["Bucket 'groq:default' has no capacity or refill rate and will allow every request"]
        );
    }

    #[test]
    fn array_paths_render_with_indices() {
        let path = vec![
            Segment::Key("providers".to_string()),
            Segment::Key("openrouter".to_string()),
            Segment::Key("api_keys".to_string()),
            Segment::Index(1),
        ];

        assert_eq!(render_path(&path), "providers.openrouter.api_keys[1]");
        assert_eq!(optional_env_field(&render_path(&path)), Some(0));
        assert_eq!(optional_env_field("rate_limit.storage.url"), None);
    }
}
