//! Common utilities for Postgres storage tests
#![allow(dead_code)]

use docstore_core::Document;
use docstore_storage_postgres::{Postgres, PostgresConfig};
use anyhow::Result;
use bb8_postgres::PostgresConnectionManager;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::{postgres, testcontainers::runners::AsyncRunner};
use tracing::Level;

/// Post document used by most postgres tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub object_id: String,
    pub owner_user_id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub deleted: bool,
    pub created_date: i64,
    pub last_updated: i64,
}

impl Post {
    pub fn new(object_id: &str, owner: &str, title: &str) -> Self {
        Self {
            object_id: object_id.to_owned(),
            owner_user_id: owner.to_owned(),
            title: title.to_owned(),
            tags: Vec::new(),
            score: 0,
            deleted: false,
            created_date: 1_700_000_000,
            last_updated: 1_700_000_000,
        }
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }
}

impl Document for Post {
    fn object_id(&self) -> &str { &self.object_id }
    fn owner_id(&self) -> Option<&str> { Some(&self.owner_user_id) }
    fn created_date(&self) -> i64 { self.created_date }
    fn last_updated(&self) -> i64 { self.last_updated }
}

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

pub async fn create_postgres_container() -> Result<(ContainerAsync<postgres::Postgres>, Postgres)> {
    create_postgres_container_with(PostgresConfig::default()).await
}

pub async fn create_postgres_container_with(config: PostgresConfig) -> Result<(ContainerAsync<postgres::Postgres>, Postgres)> {
    let container: ContainerAsync<postgres::Postgres> = postgres::Postgres::default()
        .with_db_name("docstore")
        .with_user("postgres")
        .with_password("postgres")
        .with_tag("16-alpine")
        .start()
        .await?;

    let manager = PostgresConnectionManager::new_from_stringlike(connection_string(&container).await?, tokio_postgres::NoTls)?;
    let pool = bb8::Pool::builder().max_size(config.pool_size).build(manager).await?;

    let store = Postgres::new(pool)?.with_config(config);

    Ok((container, store))
}

async fn connection_string(container: &ContainerAsync<postgres::Postgres>) -> Result<String> {
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    Ok(format!("host={host} port={port} user=postgres password=postgres dbname=docstore"))
}

/// A connection outside the store's pool, for changing the schema behind its back
pub async fn side_client(container: &ContainerAsync<postgres::Postgres>) -> Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(&connection_string(container).await?, tokio_postgres::NoTls).await?;
    tokio::spawn(connection);
    Ok(client)
}
