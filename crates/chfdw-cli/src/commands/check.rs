use std::path::Path;

use anyhow::Context;
use chfdw_core::{ConnectionDetails, FdwConfig};
use serde::Serialize;

/// Resolved options of one user mapping. The password is never included.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MappingReport {
    pub user: String,
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub has_password: bool,
    pub secure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MappingReport {
    fn resolved(user: &str, server: &str, details: &ConnectionDetails) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            driver: Some(details.driver.to_string()),
            target: Some(details.target()),
            database: Some(details.database.clone()),
            username: details.username.clone(),
            has_password: details.password.is_some(),
            secure: details.secure,
            error: None,
        }
    }

    fn failed(user: &str, server: &str, error: String) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            driver: None,
            target: None,
            database: None,
            username: None,
            has_password: false,
            secure: false,
            error: Some(error),
        }
    }
}

pub fn run(config_path: &Path, format: &str) -> anyhow::Result<()> {
    let config = FdwConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let reports = reports(&config)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&reports)?),
        _ => {
            for report in &reports {
                println!("{}", format_report(report));
            }
        }
    }

    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{failed} user mapping(s) failed to resolve");
    }
    Ok(())
}

/// Resolve every user mapping in `config`, in catalog order.
pub fn reports(config: &FdwConfig) -> anyhow::Result<Vec<MappingReport>> {
    let catalog = config.build_catalog()?;
    let mut out = Vec::new();
    for mapping in catalog.user_mappings() {
        let user = catalog.role_name(mapping.user).unwrap_or("?");
        let Some(server) = catalog.server(mapping.server) else {
            continue;
        };
        let report = match ConnectionDetails::resolve(&server.options, &mapping.options) {
            Ok(details) => {
                tracing::info!(
                    user,
                    server = %server.name,
                    driver = %details.driver,
                    "resolved user mapping"
                );
                MappingReport::resolved(user, &server.name, &details)
            }
            Err(e) => {
                tracing::warn!(
                    user,
                    server = %server.name,
                    error = %e,
                    "user mapping does not resolve"
                );
                MappingReport::failed(user, &server.name, e.to_string())
            }
        };
        out.push(report);
    }
    Ok(out)
}

fn format_report(report: &MappingReport) -> String {
    let head = format!("{}@{}", report.user, report.server);
    if let Some(error) = &report.error {
        return format!("✗ {head}: {error}");
    }
    let mut line = format!(
        "✓ {head}: {} {} database={}",
        report.driver.as_deref().unwrap_or("?"),
        report.target.as_deref().unwrap_or("?"),
        report.database.as_deref().unwrap_or("?"),
    );
    if let Some(username) = &report.username {
        line.push_str(&format!(" user={username}"));
    }
    if report.has_password {
        line.push_str(" password=********");
    }
    if report.secure {
        line.push_str(" secure");
    }
    line
}
