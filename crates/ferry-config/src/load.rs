use crate::model::{check_range, file_must_exist, AppConfig};
use crate::ConfigError;
use config::{Config, Environment};
use std::path::Path;

/// Load and validate configuration from the process environment, optionally
/// merging a `.env` file first. Variables use the `MIG_` prefix with `__`
/// separating nested sections, e.g. `MIG_IMAP__USERNAME`.
pub fn load_config(env_file: Option<&Path>) -> Result<AppConfig, ConfigError> {
    if let Some(path) = env_file {
        dotenvy::from_path(path)?;
    }

    let source = Environment::with_prefix("MIG")
        .separator("__")
        .try_parsing(true);

    let cfg: AppConfig = Config::builder()
        .add_source(source)
        .build()?
        .try_deserialize()?;

    validate(&cfg).map_err(ConfigError::Invalid)?;
    Ok(normalize(cfg))
}

fn validate(cfg: &AppConfig) -> Result<(), String> {
    if let Some(imap) = &cfg.imap {
        if imap.username.trim().is_empty() {
            return Err("imap.username must not be blank".to_string());
        }
        if imap.app_password.is_empty() {
            return Err("imap.app_password must not be blank".to_string());
        }
        if !imap.ssl {
            return Err("imap.ssl=false is not supported; the fetcher only speaks TLS".to_string());
        }
        check_range("imap.connections", imap.connections, 1, 10)?;
        check_range("imap.batch_size", imap.batch_size, 1, 500)?;
        if imap.search_query.trim().is_empty() {
            return Err("imap.search_query must not be blank".to_string());
        }
    }

    if let Some(gmail) = &cfg.gmail {
        let email = gmail.target_user_email.trim();
        if !email.contains('@') || email.len() < 3 {
            return Err(format!(
                "gmail.target_user_email does not look like an address: {email:?}"
            ));
        }
        file_must_exist("gmail.credentials_file", &gmail.credentials_file)?;
        if gmail.token_file.is_dir() {
            return Err(format!(
                "gmail.token_file is a directory: {} (set MIG_GMAIL__TOKEN_FILE to a file path)",
                gmail.token_file.display()
            ));
        }
        if gmail.label_prefix.trim().is_empty() {
            return Err("gmail.label_prefix must not be blank".to_string());
        }
    }

    for addr in &cfg.filter.target_addresses {
        if !addr.contains('@') {
            return Err(format!("invalid email in filter.target_addresses: {addr:?}"));
        }
    }

    check_range(
        "storage.fingerprint_body_bytes",
        cfg.storage.fingerprint_body_bytes,
        0,
        1024 * 1024,
    )?;
    check_range("concurrency.gmail_workers", cfg.concurrency.gmail_workers, 1, 50)?;
    check_range(
        "concurrency.imap_fetch_concurrency",
        cfg.concurrency.imap_fetch_concurrency,
        1,
        50,
    )?;
    check_range("concurrency.queue_maxsize", cfg.concurrency.queue_maxsize, 1, 10_000)?;

    Ok(())
}

fn normalize(mut cfg: AppConfig) -> AppConfig {
    let mut seen = std::collections::BTreeSet::new();
    cfg.filter.target_addresses = cfg
        .filter
        .target_addresses
        .iter()
        .map(|addr| addr.trim().to_ascii_lowercase())
        .filter(|addr| seen.insert(addr.clone()))
        .collect();

    if let Some(gmail) = &mut cfg.gmail {
        gmail.label_prefix = gmail.label_prefix.trim().to_string();
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_list_str;

    #[test]
    fn parses_csv_and_json_lists() {
        assert_eq!(
            parse_list_str("a@d.com, b@d.com").unwrap(),
            vec!["a@d.com".to_string(), " b@d.com".to_string()]
        );
        assert_eq!(
            parse_list_str(r#"["x@d.com","y@d.com"]"#).unwrap(),
            vec!["x@d.com".to_string(), "y@d.com".to_string()]
        );
        assert!(parse_list_str("").unwrap().is_empty());
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut cfg = AppConfig::default();
        cfg.concurrency.gmail_workers = 200;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn normalizes_and_dedupes_addresses() {
        let mut cfg = AppConfig::default();
        cfg.filter.target_addresses = vec![
            "Alias@Custom.COM".to_string(),
            "alias@custom.com".to_string(),
        ];
        let cfg = normalize(cfg);
        assert_eq!(cfg.filter.target_addresses, vec!["alias@custom.com".to_string()]);
    }

    #[test]
    fn defaults_are_in_range() {
        let cfg = AppConfig::default();
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.concurrency.gmail_workers, 10);
        assert_eq!(cfg.concurrency.queue_maxsize, 1000);
        assert_eq!(cfg.storage.fingerprint_body_bytes, 4096);
    }
}
