use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chfdw_conn::{Column, ConnectionCache, Cursor, DriverFactory, DriverSettings, LocalHost, Row};
use chfdw_core::{Catalog, FdwConfig, MappingId};

pub fn run(
    config_path: &Path,
    server: &str,
    user: &str,
    write: bool,
    format: &str,
    sql: &str,
) -> anyhow::Result<()> {
    let config = FdwConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let catalog = config.build_catalog()?;
    let mapping = find_mapping(&catalog, server, user)?;
    tracing::info!(server, user, mapping = %mapping, write, "running query");

    let host = Arc::new(LocalHost::new(catalog));
    let factory = DriverFactory::new(DriverSettings::from(&config.connection));
    let cache = ConnectionCache::new(host.clone(), Arc::new(factory));

    host.begin();
    let result = cache
        .acquire(mapping, !write)
        .and_then(|handle| handle.execute(sql));
    let cursor = match result {
        Ok(cursor) => {
            host.commit();
            cursor
        }
        Err(e) => {
            host.abort();
            let sqlstate = e.sqlstate();
            tracing::warn!(server, user, sqlstate, error = %e, "query failed");
            return Err(anyhow::Error::new(e).context(format!("query failed [{sqlstate}]")));
        }
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&to_json(cursor))?),
        _ => print!("{}", to_text(cursor)),
    }
    cache.log_stats();
    Ok(())
}

/// Look up `user`'s mapping on `server` without creating anything.
fn find_mapping(catalog: &Catalog, server: &str, user: &str) -> anyhow::Result<MappingId> {
    let server_id = catalog
        .server_by_name(server)
        .with_context(|| format!("server \"{server}\" does not exist"))?
        .id;
    catalog
        .user_mappings()
        .into_iter()
        .find(|m| m.server == server_id && catalog.role_name(m.user) == Some(user))
        .map(|m| m.id)
        .with_context(|| format!("user mapping not found for \"{user}\" on server \"{server}\""))
}

/// Tab-separated header plus rows; NULL is printed as `NULL`.
fn to_text(cursor: Cursor) -> String {
    let mut out = String::new();
    let header: Vec<&str> = cursor.columns().iter().map(|c| c.name.as_str()).collect();
    if !header.is_empty() {
        out.push_str(&header.join("\t"));
        out.push('\n');
    }
    for row in cursor {
        let cells: Vec<&str> = row.iter().map(|v| v.as_deref().unwrap_or("NULL")).collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// One JSON object per row, keyed by column name.
fn to_json(cursor: Cursor) -> serde_json::Value {
    let columns: Vec<Column> = cursor.columns().to_vec();
    let rows: Vec<serde_json::Value> = cursor.map(|row: Row| row_object(&columns, row)).collect();
    serde_json::Value::Array(rows)
}

fn row_object(columns: &[Column], row: Row) -> serde_json::Value {
    let object = columns
        .iter()
        .zip(row)
        .map(|(col, value)| {
            let value = value.map_or(serde_json::Value::Null, serde_json::Value::String);
            (col.name.clone(), value)
        })
        .collect::<serde_json::Map<_, _>>();
    serde_json::Value::Object(object)
}
