use crate::entities::{albums, files, prelude::*, users};
use crate::utils::auth;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, Schema, Set,
};
use std::time::Duration;
use tracing::info;

pub async fn setup_database(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    if let Some(dir) = sqlite_parent_dir(database_url) {
        tokio::fs::create_dir_all(&dir).await?;
    }

    let mut opt = ConnectOptions::new(database_url);
    opt.max_connections(32)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    info!("Database connected: {}", database_url);

    run_migrations(&db).await?;
    seed_root_user(&db).await?;

    Ok(db)
}

/// Directory holding the SQLite file, if the URL points at one.
fn sqlite_parent_dir(database_url: &str) -> Option<std::path::PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    if path.starts_with(':') {
        // ":memory:" and friends
        return None;
    }
    let path = path.split('?').next().unwrap_or(path);
    std::path::Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmts = vec![
        schema
            .create_table_from_entity(users::Entity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(albums::Entity)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(files::Entity)
            .if_not_exists()
            .to_owned(),
    ];

    for stmt in stmts {
        db.execute(builder.build(&stmt)).await?;
    }

    Ok(())
}

/// The root account is re-created whenever the users table is empty. Its
/// password must be changed through the API afterwards.
pub async fn seed_root_user(db: &DatabaseConnection) -> anyhow::Result<()> {
    if Users::find().count(db).await? > 0 {
        return Ok(());
    }

    let now = Utc::now().timestamp();
    let token = auth::generate_token();
    let root = users::ActiveModel {
        username: Set("root".to_string()),
        password: Set(auth::hash_password("changeme")?),
        token: Set(token),
        enabled: Set(true),
        permission: Set(users::permissions::SUPERADMIN),
        timestamp: Set(now),
        registration: Set(now),
        ..Default::default()
    };
    root.insert(db).await?;

    info!("Seeded root user (password: \"changeme\" - change it immediately)");
    Ok(())
}
