use anyhow::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Migration scripts compiled into the binary. Every script is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[
    ("add_indexes.sql", include_str!("sql/add_indexes.sql")),
    ("001_create_videos.sql", include_str!("sql/001_create_videos.sql")),
    ("002_create_detections.sql", include_str!("sql/002_create_detections.sql")),
    ("003_create_alerts.sql", include_str!("sql/003_create_alerts.sql")),
];

/// Numbered scripts first, in numeric order; index scripts after the tables exist
fn order_value(name: &str) -> usize {
    if name.starts_with("add_indexes") {
        return 2000;
    }
    name.split('_')
        .next()
        .and_then(|prefix| prefix.parse::<usize>().ok())
        .unwrap_or(usize::MAX)
}

fn ordered() -> Vec<(&'static str, &'static str)> {
    let mut entries = MIGRATIONS.to_vec();
    entries.sort_by_key(|(name, _)| order_value(name));
    entries
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in ordered() {
        pool.execute(sql).await?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}
